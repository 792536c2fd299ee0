//! Node runtime.
//!
//! A [`Node`] hosts one coordinator and one participant that share a log,
//! a lock manager and an account store. It dispatches protocol requests to
//! them, answers status queries, and carries the fault-injection hooks:
//!
//! - `simulate_crash` stops answering, closes the log and drops every
//!   volatile structure. Requests already being served never get a reply.
//! - `simulate_delay` holds each incoming request before serving it.
//! - `restart` rebuilds the node from its log and resumes unfinished work.
//!
//! Requests a node sends to itself are served in-process without going
//! through the network or the simulated delay.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use concord_common::config::NodeConfig;
use concord_common::types::{NodeId, TxnId};
use concord_txn::{LockManager, LockManagerConfig, MemoryStore, ResourceManager};
use concord_wal::{Wal, WalConfig};

use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::error::{TxnError, TxnResult};
use crate::failure::FailureDetector;
use crate::participant::{Participant, ParticipantConfig};
use crate::protocol::{
    Liveness, NodeStatusReport, Request, Response, SubmitMode, TransactionRequest,
    TxnStatusReport,
};
use crate::recovery::plan_recovery;
use crate::state::{CoordinatorState, ParticipantState};
use crate::transport::{BoxFuture, RequestHandler, Transport, TransportError, TransportResult};

/// Volatile state of a running node, rebuilt on every restart.
struct Runtime {
    epoch: u64,
    wal: Arc<Wal>,
    coordinator: Arc<Coordinator>,
    participant: Arc<Participant>,
    detector: Arc<FailureDetector>,
    transport: Arc<dyn Transport>,
    shutdown: watch::Sender<bool>,
}

/// One member of the cluster.
pub struct Node {
    config: NodeConfig,
    network: Arc<dyn Transport>,
    liveness: RwLock<Liveness>,
    epoch: AtomicU64,
    runtime: RwLock<Option<Arc<Runtime>>>,
    this: Weak<Node>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("liveness", &self.liveness())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl Node {
    /// Starts a node, recovering whatever its log already holds.
    ///
    /// `network` carries requests to the other nodes; the caller makes
    /// the node reachable by registering it with the same network.
    pub fn start(config: NodeConfig, network: Arc<dyn Transport>) -> TxnResult<Arc<Self>> {
        let node = Arc::new_cyclic(|this| Self {
            config,
            network,
            liveness: RwLock::new(Liveness::Up),
            epoch: AtomicU64::new(0),
            runtime: RwLock::new(None),
            this: this.clone(),
        });
        node.boot()?;
        Ok(node)
    }

    /// Builds a fresh runtime from the log.
    fn boot(&self) -> TxnResult<()> {
        let id = self.id();
        let timeouts = &self.config.timeouts;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let wal = Arc::new(Wal::open(WalConfig::new(self.config.wal_dir.clone()))?);
        let records = wal.records()?;
        let plan = plan_recovery(&records);

        let store: Arc<dyn ResourceManager> =
            Arc::new(MemoryStore::with_accounts(self.config.accounts.clone()));
        plan.apply_to(store.as_ref());

        let locks = Arc::new(LockManager::with_config(
            LockManagerConfig::new(timeouts.lock_timeout())
                .with_deadlock_detection(self.config.deadlock_detection),
        ));

        let transport: Arc<dyn Transport> = Arc::new(NodeTransport {
            node: self.this.clone(),
            network: Arc::clone(&self.network),
        });
        let detector = Arc::new(FailureDetector::new(
            id,
            self.config.peer_ids(),
            timeouts.heartbeat_interval(),
            timeouts.heartbeat_timeout(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let participant = Arc::new(Participant::new(
            id,
            Arc::clone(&wal),
            locks,
            store,
            ParticipantConfig {
                retained: self.config.retained_transactions,
                ..ParticipantConfig::from_timeouts(timeouts, self.config.cooperative_termination)
            },
        ));
        participant.recover(&plan)?;

        let coordinator = Arc::new(Coordinator::new(
            id,
            Arc::clone(&wal),
            Arc::clone(&transport),
            Arc::clone(&detector),
            CoordinatorConfig {
                retained: self.config.retained_transactions,
                ..CoordinatorConfig::from_timeouts(timeouts)
            },
            shutdown_rx.clone(),
        ));
        let pending = coordinator.recover(&plan);

        let runtime = Arc::new(Runtime {
            epoch,
            wal,
            coordinator: Arc::clone(&coordinator),
            participant: Arc::clone(&participant),
            detector: Arc::clone(&detector),
            transport: Arc::clone(&transport),
            shutdown,
        });
        *self.runtime.write() = Some(runtime);
        *self.liveness.write() = Liveness::Up;

        for txn in &pending {
            coordinator.spawn_drive(*txn);
        }
        tokio::spawn(detector.run(Arc::clone(&transport), shutdown_rx.clone()));
        tokio::spawn(participant.run_resolver(transport, shutdown_rx));

        info!(
            node = %id,
            epoch,
            records = records.len(),
            resumed = pending.len(),
            in_doubt = plan.in_doubt().count(),
            "node started"
        );
        Ok(())
    }

    /// Returns this node's id.
    pub fn id(&self) -> NodeId {
        self.config.id()
    }

    /// Returns the node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Returns the log directory.
    pub fn wal_dir(&self) -> PathBuf {
        self.config.wal_dir.clone()
    }

    /// Returns the simulated liveness.
    pub fn liveness(&self) -> Liveness {
        *self.liveness.read()
    }

    fn is_crashed(&self) -> bool {
        self.liveness() == Liveness::Crashed
    }

    fn runtime(&self) -> TxnResult<Arc<Runtime>> {
        self.runtime
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TxnError::NodeUnavailable(self.id()))
    }

    /// Stops the node as if its process died.
    pub fn simulate_crash(&self) {
        *self.liveness.write() = Liveness::Crashed;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(runtime) = self.runtime.write().take() else {
            return;
        };
        runtime.shutdown.send_replace(true);
        if let Err(e) = runtime.wal.close() {
            warn!(node = %self.id(), error = %e, "failed to close log");
        }
        warn!(node = %self.id(), epoch = runtime.epoch, "node crashed");
    }

    /// Holds every incoming request for `delay` before serving it.
    pub fn simulate_delay(&self, delay: Duration) -> TxnResult<()> {
        let mut liveness = self.liveness.write();
        if *liveness == Liveness::Crashed {
            return Err(TxnError::NodeUnavailable(self.id()));
        }
        *liveness = Liveness::Delayed(delay);
        info!(node = %self.id(), delay_ms = delay.as_millis() as u64, "delaying responses");
        Ok(())
    }

    /// Makes the local participant vote abort on every PREPARE.
    pub fn simulate_reject(&self, reject: bool) -> TxnResult<()> {
        self.runtime()?.participant.set_reject_prepare(reject);
        Ok(())
    }

    /// Removes a simulated delay and prepare rejection. A crashed node
    /// stays crashed until restarted.
    pub fn clear_faults(&self) {
        {
            let mut liveness = self.liveness.write();
            if let Liveness::Delayed(_) = *liveness {
                *liveness = Liveness::Up;
            }
        }
        if let Ok(runtime) = self.runtime() {
            runtime.participant.set_reject_prepare(false);
        }
    }

    /// Restarts the node from its log, crashing it first if it is running.
    pub fn restart(&self) -> TxnResult<()> {
        if self.runtime.read().is_some() {
            self.simulate_crash();
        }
        self.boot()
    }

    /// Asks for the outcome of every in-doubt transaction right away.
    /// Returns how many were resolved.
    pub async fn recover(&self) -> TxnResult<usize> {
        let runtime = self.runtime()?;
        Ok(runtime
            .participant
            .resolve_in_doubt(runtime.transport.as_ref(), Duration::ZERO)
            .await)
    }

    /// Pings every peer once.
    pub async fn probe_peers(&self) -> TxnResult<()> {
        let runtime = self.runtime()?;
        runtime.detector.probe_all(runtime.transport.as_ref()).await;
        Ok(())
    }

    /// Starts a transaction coordinated by this node.
    ///
    /// In async mode the id is returned once the participants are
    /// enlisted; in sync mode once the transaction is finished.
    pub async fn submit(&self, request: TransactionRequest, mode: SubmitMode) -> TxnResult<TxnId> {
        let runtime = self.runtime()?;
        let txn = runtime.coordinator.begin(&request)?;
        match mode {
            SubmitMode::Async => runtime.coordinator.spawn_drive(txn),
            SubmitMode::Sync => {
                runtime.coordinator.drive(txn).await?;
            }
        }
        Ok(txn)
    }

    /// Waits until a transaction coordinated here is finished.
    pub async fn wait_terminal(&self, txn: TxnId) -> TxnResult<CoordinatorState> {
        self.runtime()?.coordinator.wait_terminal(txn).await
    }

    /// Returns what this node knows about `txn`, from both roles.
    pub fn transaction_status(&self, txn: TxnId) -> TxnResult<TxnStatusReport> {
        let runtime = self.runtime()?;
        let global = runtime.coordinator.status(txn);
        let local = runtime.participant.status(txn);
        match (global, local) {
            (Some(mut report), Some(local)) => {
                report.participant_state = local.participant_state;
                report.blocked = local.blocked;
                Ok(report)
            }
            (Some(report), None) | (None, Some(report)) => Ok(report),
            (None, None) => Err(TxnError::NotFound(txn)),
        }
    }

    /// Lists the most recent transactions coordinated here.
    pub fn list_transactions(&self, limit: usize) -> TxnResult<Vec<TxnStatusReport>> {
        Ok(self.runtime()?.coordinator.list_transactions(limit))
    }

    /// Returns the coordinator state of `txn`.
    pub fn coordinator_state(&self, txn: TxnId) -> Option<CoordinatorState> {
        self.runtime().ok()?.coordinator.state(txn)
    }

    /// Returns the participant state of `txn`.
    pub fn participant_state(&self, txn: TxnId) -> Option<ParticipantState> {
        self.runtime().ok()?.participant.state(txn)
    }

    /// Returns liveness and load. Has no effect on protocol state.
    pub fn node_status(&self) -> NodeStatusReport {
        let liveness = self.liveness();
        let mut report = NodeStatusReport {
            node: self.id(),
            liveness,
            open_transactions: 0,
            coordinating: 0,
            participating: 0,
            in_doubt: 0,
            locks_held: 0,
            peers: Vec::new(),
        };
        if let Ok(runtime) = self.runtime() {
            report.coordinating = runtime.coordinator.open_count();
            report.participating = runtime.participant.open_count();
            report.open_transactions = report.coordinating + report.participating;
            report.in_doubt = runtime.participant.in_doubt_count();
            report.locks_held = runtime.participant.locks().lock_count();
            report.peers = runtime.detector.snapshot();
        }
        report
    }

    /// Returns every account and its balance, or `None` while crashed.
    pub fn snapshot(&self) -> Option<BTreeMap<String, i64>> {
        self.runtime().ok().map(|r| r.participant.store().snapshot())
    }

    /// Returns the number of locks held on this node.
    pub fn lock_count(&self) -> usize {
        self.runtime()
            .map(|r| r.participant.locks().lock_count())
            .unwrap_or(0)
    }

    /// Serves one request against the current runtime.
    async fn dispatch(&self, runtime: &Runtime, from: NodeId, request: Request) -> Response {
        if from != self.id() && runtime.detector.knows(from) {
            runtime.detector.record_success(from);
        }
        let result = match request {
            Request::Execute { txn, op } => runtime
                .participant
                .execute(txn, op)
                .await
                .map(|value| Response::Executed { value }),
            Request::Prepare {
                txn,
                participants,
                operations,
            } => Ok(Response::Vote {
                vote: runtime
                    .participant
                    .on_prepare(txn, participants, operations)
                    .await,
            }),
            Request::Commit { txn } => runtime.participant.on_commit(txn).await.map(|_| Response::Ack),
            Request::Abort { txn } => runtime.participant.on_abort(txn).await.map(|_| Response::Ack),
            Request::QueryOutcome { txn } => Ok(Response::Outcome {
                outcome: runtime.coordinator.query_outcome(txn),
            }),
            Request::PeerOutcome { txn } => runtime
                .participant
                .known_outcome(txn)
                .await
                .map(|outcome| Response::Outcome { outcome }),
            Request::Ping => Ok(Response::Pong { node: self.id() }),
            Request::Submit { request, mode } => self
                .submit(request, mode)
                .await
                .map(|txn| Response::Submitted { txn }),
            Request::Status { txn } => self.transaction_status(txn).map(Response::TxnStatus),
            Request::NodeStatus => Ok(Response::NodeStatus(self.node_status())),
        };
        result.unwrap_or_else(|e| {
            debug!(node = %self.id(), error = %e, "request failed");
            Response::error(&e)
        })
    }

    /// Serves a request and withholds the answer if the node crashed or
    /// restarted meanwhile.
    async fn serve(&self, from: NodeId, request: Request) -> Option<Response> {
        let runtime = self.runtime().ok()?;
        let response = self.dispatch(&runtime, from, request).await;
        if self.is_crashed() || self.epoch.load(Ordering::SeqCst) != runtime.epoch {
            return None;
        }
        Some(response)
    }
}

impl RequestHandler for Node {
    fn handle(&self, from: NodeId, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            match self.liveness() {
                Liveness::Crashed => return std::future::pending().await,
                Liveness::Delayed(delay) => tokio::time::sleep(delay).await,
                Liveness::Up => {}
            }
            if self.is_crashed() {
                return std::future::pending().await;
            }
            match self.serve(from, request).await {
                Some(response) => response,
                None => std::future::pending().await,
            }
        })
    }
}

/// Outbound transport of a running node.
///
/// Refuses to send while the node is crashed and serves requests
/// addressed to the node itself in-process.
struct NodeTransport {
    node: Weak<Node>,
    network: Arc<dyn Transport>,
}

impl Transport for NodeTransport {
    fn local_id(&self) -> NodeId {
        self.network.local_id()
    }

    fn call(&self, to: NodeId, request: Request) -> BoxFuture<'_, TransportResult<Response>> {
        Box::pin(async move {
            let node = self.node.upgrade().ok_or(TransportError::Closed)?;
            if node.is_crashed() {
                return Err(TransportError::Closed);
            }
            if to != node.id() {
                return self.network.call(to, request).await;
            }
            let from = node.id();
            let served = tokio::spawn(async move { node.serve(from, request).await })
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    node_id: to,
                    reason: e.to_string(),
                })?;
            match served {
                Some(response) => Ok(response),
                None => std::future::pending().await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use concord_common::config::TimeoutConfig;
    use concord_common::types::Decision;
    use tempfile::TempDir;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig {
            prepare_timeout_ms: 300,
            commit_timeout_ms: 300,
            execute_timeout_ms: 1000,
            lock_timeout_ms: 200,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 150,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 50,
            outcome_query_interval_ms: 100,
            active_idle_timeout_ms: 2_000,
        }
    }

    fn start_pair(dir: &TempDir) -> (Arc<MemoryNetwork>, Arc<Node>, Arc<Node>) {
        let network = MemoryNetwork::shared();
        let mut nodes = Vec::new();
        for (id, peer) in [(1, 2), (2, 1)] {
            let config = NodeConfig::new(n(id))
                .with_wal_dir(dir.path().join(format!("node{}", id)))
                .with_peer(n(peer), format!("127.0.0.1:{}", 7400 + peer))
                .with_account("a", 100)
                .with_account("b", 100)
                .with_timeouts(timeouts());
            let node = Node::start(config, Arc::new(network.transport(n(id)))).unwrap();
            network.register(n(id), node.clone());
            nodes.push(node);
        }
        let second = nodes.pop().unwrap();
        let first = nodes.pop().unwrap();
        (network, first, second)
    }

    #[tokio::test]
    async fn test_submit_sync_commits_on_both_nodes() {
        let dir = TempDir::new().unwrap();
        let (_network, n1, n2) = start_pair(&dir);

        let request = TransactionRequest::transfer(n(1), "a", n(2), "b", 25);
        let txn = n1.submit(request, SubmitMode::Sync).await.unwrap();

        let status = n1.transaction_status(txn).unwrap();
        assert_eq!(status.coordinator_state, Some(CoordinatorState::Committed));
        assert_eq!(status.participant_state, Some(ParticipantState::Committed));
        assert_eq!(status.decision, Some(Decision::Commit));
        assert_eq!(n2.participant_state(txn), Some(ParticipantState::Committed));

        assert_eq!(n1.snapshot().unwrap()["a"], 75);
        assert_eq!(n2.snapshot().unwrap()["b"], 125);
        assert_eq!(n1.lock_count(), 0);
        assert_eq!(n2.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_async_then_wait() {
        let dir = TempDir::new().unwrap();
        let (_network, n1, n2) = start_pair(&dir);

        let request = TransactionRequest::transfer(n(2), "a", n(1), "b", 10);
        let txn = n1.submit(request, SubmitMode::Async).await.unwrap();
        assert_eq!(n1.wait_terminal(txn).await.unwrap(), CoordinatorState::Committed);
        assert_eq!(n2.snapshot().unwrap()["a"], 90);
    }

    #[tokio::test]
    async fn test_crashed_node_does_not_answer() {
        let dir = TempDir::new().unwrap();
        let (network, _n1, n2) = start_pair(&dir);

        n2.simulate_crash();
        assert_eq!(n2.liveness(), Liveness::Crashed);
        assert!(n2.snapshot().is_none());
        assert_eq!(n2.node_status().open_transactions, 0);

        let t1 = network.transport(n(1));
        let result =
            crate::transport::call_timeout(&t1, n(2), Request::Ping, Duration::from_millis(50))
                .await;
        assert!(matches!(result, Err(TransportError::Timeout)));

        n2.restart().unwrap();
        assert_eq!(n2.liveness(), Liveness::Up);
        assert!(t1.call(n(2), Request::Ping).await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_keeps_committed_balances() {
        let dir = TempDir::new().unwrap();
        let (_network, n1, n2) = start_pair(&dir);

        let request = TransactionRequest::transfer(n(1), "a", n(2), "b", 40);
        n1.submit(request, SubmitMode::Sync).await.unwrap();
        n1.restart().unwrap();
        n2.restart().unwrap();

        assert_eq!(n1.snapshot().unwrap()["a"], 60);
        assert_eq!(n2.snapshot().unwrap()["b"], 140);

        // Sequence numbers continue after the restart.
        let txn = n1
            .submit(TransactionRequest::transfer(n(1), "a", n(2), "b", 1), SubmitMode::Sync)
            .await
            .unwrap();
        assert_eq!(txn.sequence(), 2);
    }

    #[tokio::test]
    async fn test_delay_and_clear_faults() {
        let dir = TempDir::new().unwrap();
        let (_network, _n1, n2) = start_pair(&dir);

        n2.simulate_delay(Duration::from_millis(20)).unwrap();
        assert_eq!(n2.node_status().liveness, Liveness::Delayed(Duration::from_millis(20)));
        n2.clear_faults();
        assert_eq!(n2.liveness(), Liveness::Up);

        n2.simulate_crash();
        assert!(n2.simulate_delay(Duration::from_millis(20)).is_err());
        n2.clear_faults();
        assert_eq!(n2.liveness(), Liveness::Crashed);
    }

    #[tokio::test]
    async fn test_status_for_unknown_transaction() {
        let dir = TempDir::new().unwrap();
        let (_network, n1, _n2) = start_pair(&dir);
        let err = n1.transaction_status(TxnId::compose(n(1), 42)).unwrap_err();
        assert!(matches!(err, TxnError::NotFound(_)));
    }
}
