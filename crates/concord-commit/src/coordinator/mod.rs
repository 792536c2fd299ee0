//! Coordinator side of two-phase commit.
//!
//! The coordinator owns the global state of the transactions it begins and
//! drives each one through
//!
//! ```text
//! INIT ──► PREPARING ──► COMMITTING ──► COMMITTED
//!   │           │
//!   └───────────┴──────► ABORTING ───► ABORTED
//! ```
//!
//! Operations are dispatched one at a time while the transaction is in
//! INIT; a failed operation aborts it from there. The PREPARE record is
//! written only once every operation was executed, so a transaction found
//! in PREPARING after a restart can safely be asked to vote again.
//!
//! The decision is logged before any participant hears about it, and
//! dissemination retries until every participant acknowledged. Only the
//! node's shutdown interrupts it; recovery resumes from the log.
//!
//! Once END is logged the transaction moves to a bounded history of
//! finished transactions, which keeps answering status and outcome queries
//! until it is pushed out by newer ones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use concord_common::config::TimeoutConfig;
use concord_common::constants::DEFAULT_RETAINED_TRANSACTIONS;
use concord_common::error::ErrorCode;
use concord_common::types::{Decision, NodeId, TxnId, Vote};
use concord_wal::{LogPayload, Role, Wal};

use crate::error::{TxnError, TxnResult};
use crate::failure::FailureDetector;
use crate::history::History;
use crate::protocol::{
    Outcome, Request, Response, TransactionRequest, TxnOperation, TxnStatusReport, VoteRecord,
};
use crate::recovery::{CoordinatorAction, RecoveryPlan};
use crate::state::CoordinatorState;
use crate::transport::{call_timeout, Transport, TransportError};
use crate::unix_millis;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on each participant's vote.
    pub prepare_timeout: Duration,
    /// Bound on each COMMIT/ABORT attempt.
    pub commit_timeout: Duration,
    /// Bound on each dispatched operation.
    pub execute_timeout: Duration,
    /// First dissemination retry delay.
    pub initial_backoff: Duration,
    /// Largest dissemination retry delay.
    pub max_backoff: Duration,
    /// Finished transactions remembered after END.
    pub retained: usize,
}

impl CoordinatorConfig {
    /// Derives the coordinator settings from the node's timeouts.
    pub fn from_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            prepare_timeout: timeouts.prepare_timeout(),
            commit_timeout: timeouts.commit_timeout(),
            execute_timeout: timeouts.execute_timeout(),
            initial_backoff: timeouts.retry_initial_backoff(),
            max_backoff: timeouts.retry_max_backoff(),
            retained: DEFAULT_RETAINED_TRANSACTIONS,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_timeouts(&TimeoutConfig::default())
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        let jitter = base.as_millis() as u64 / 4;
        let jitter = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Global view of one transaction.
#[derive(Debug, Clone)]
struct GlobalTxn {
    participants: Vec<NodeId>,
    operations: Vec<TxnOperation>,
    operation_counts: Vec<u32>,
    votes: BTreeMap<NodeId, Vote>,
    acked: BTreeSet<NodeId>,
    decision: Option<Decision>,
    /// Rebuilt from the log; the operations themselves are gone.
    recovered: bool,
    created_at_ms: u64,
}

/// A transaction's view and a channel announcing its state.
#[derive(Debug)]
struct TxnEntry {
    view: Mutex<GlobalTxn>,
    state: watch::Sender<CoordinatorState>,
}

impl TxnEntry {
    fn new(view: GlobalTxn, state: CoordinatorState) -> Arc<Self> {
        let (tx, _) = watch::channel(state);
        Arc::new(Self {
            view: Mutex::new(view),
            state: tx,
        })
    }

    fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn transition(&self, txn: TxnId, next: CoordinatorState) -> TxnResult<()> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(TxnError::InvalidState {
                txn,
                state: current.to_string(),
                expected: "an earlier phase",
            });
        }
        self.state.send_replace(next);
        debug!(txn = %txn, from = %current, to = %next, "coordinator state change");
        Ok(())
    }
}

/// Drives two-phase commit for the transactions this node begins.
pub struct Coordinator {
    node_id: NodeId,
    wal: Arc<Wal>,
    transport: Arc<dyn Transport>,
    detector: Arc<FailureDetector>,
    config: CoordinatorConfig,
    next_sequence: AtomicU64,
    txns: DashMap<TxnId, Arc<TxnEntry>>,
    finished: Mutex<History<Arc<TxnEntry>>>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.node_id)
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .field("transactions", &self.txns.len())
            .field("finished", &self.finished.lock().len())
            .finish()
    }
}

impl Coordinator {
    /// Creates a coordinator. Dissemination stops when `shutdown` fires.
    pub fn new(
        node_id: NodeId,
        wal: Arc<Wal>,
        transport: Arc<dyn Transport>,
        detector: Arc<FailureDetector>,
        config: CoordinatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_id,
            wal,
            transport,
            detector,
            finished: Mutex::new(History::new(config.retained)),
            config,
            next_sequence: AtomicU64::new(1),
            txns: DashMap::new(),
            shutdown,
        }
    }

    fn lookup(&self, txn: TxnId) -> Option<Arc<TxnEntry>> {
        if let Some(entry) = self.txns.get(&txn) {
            return Some(Arc::clone(entry.value()));
        }
        self.finished.lock().get(txn)
    }

    fn entry(&self, txn: TxnId) -> TxnResult<Arc<TxnEntry>> {
        self.lookup(txn).ok_or(TxnError::NotFound(txn))
    }

    /// Moves a finished transaction to the history.
    fn retire(&self, txn: TxnId, entry: Arc<TxnEntry>) {
        let evicted = self.finished.lock().insert(txn, entry);
        self.txns.remove(&txn);
        if evicted > 0 {
            debug!(txn = %txn, evicted, "dropped oldest finished transactions");
        }
    }

    /// Enlists the participants of `request` in a new transaction.
    ///
    /// Fails without creating anything if the request is malformed or a
    /// participant is unknown or considered down.
    pub fn begin(&self, request: &TransactionRequest) -> TxnResult<TxnId> {
        request.validate()?;
        for &node in &request.participants {
            if !self.detector.knows(node) {
                return Err(TxnError::Enlistment(format!("unknown participant {}", node)));
            }
            if self.detector.is_down(node) {
                return Err(TxnError::Enlistment(format!(
                    "participant {} is unreachable",
                    node
                )));
            }
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let txn = TxnId::try_compose(self.node_id, sequence).ok_or_else(|| {
            TxnError::Enlistment(format!(
                "node {} cannot coordinate: ids above {} do not fit a transaction id",
                self.node_id,
                TxnId::MAX_COORDINATOR
            ))
        })?;
        self.wal.append(
            txn,
            Role::Coordinator,
            LogPayload::Begin {
                participants: request.participants.clone(),
            },
        )?;

        let view = GlobalTxn {
            participants: request.participants.clone(),
            operations: request.operations.clone(),
            operation_counts: request.operation_counts(),
            votes: BTreeMap::new(),
            acked: BTreeSet::new(),
            decision: None,
            recovered: false,
            created_at_ms: unix_millis(),
        };
        self.txns.insert(txn, TxnEntry::new(view, CoordinatorState::Init));
        info!(txn = %txn, participants = ?request.participants, "transaction begun");
        Ok(txn)
    }

    /// Dispatches every operation to its participant, in order.
    pub async fn execute_all(&self, txn: TxnId) -> TxnResult<()> {
        let entry = self.entry(txn)?;
        let operations = entry.view.lock().operations.clone();

        for TxnOperation { node, op } in operations {
            let request = Request::Execute { txn, op };
            let response = call_timeout(
                self.transport.as_ref(),
                node,
                request,
                self.config.execute_timeout,
            )
            .await
            .map_err(|e| {
                warn!(txn = %txn, node = %node, error = %e, "execute not answered");
                TxnError::ParticipantUnreachable { node, txn }
            })?;

            match response.into_result()? {
                Response::Executed { value } => {
                    debug!(txn = %txn, node = %node, ?value, "operation executed");
                }
                other => {
                    return Err(TxnError::Remote {
                        code: ErrorCode::Internal,
                        message: format!("unexpected response {:?}", other),
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs the voting phase and returns the resulting decision.
    ///
    /// Any abort vote, error or missing answer yields abort. Nothing is
    /// logged for the decision here.
    pub async fn prepare(&self, txn: TxnId) -> TxnResult<Decision> {
        let entry = self.entry(txn)?;
        let (participants, counts) = {
            let view = entry.view.lock();
            (view.participants.clone(), view.operation_counts.clone())
        };

        if entry.state() == CoordinatorState::Init {
            self.wal.append(
                txn,
                Role::Coordinator,
                LogPayload::Prepare {
                    participants: participants.clone(),
                    operation_counts: counts.clone(),
                },
            )?;
            entry.transition(txn, CoordinatorState::Preparing)?;
        } else if entry.state() != CoordinatorState::Preparing {
            return Err(TxnError::InvalidState {
                txn,
                state: entry.state().to_string(),
                expected: "INIT or PREPARING",
            });
        }

        let requests = participants.iter().zip(counts).map(|(&node, operations)| {
            let request = Request::Prepare {
                txn,
                participants: participants.clone(),
                operations,
            };
            async move {
                let vote = match call_timeout(
                    self.transport.as_ref(),
                    node,
                    request,
                    self.config.prepare_timeout,
                )
                .await
                {
                    Ok(Response::Vote { vote }) => vote,
                    Ok(other) => {
                        warn!(txn = %txn, node = %node, response = ?other, "bad prepare answer, counting as abort");
                        Vote::Abort
                    }
                    Err(TransportError::Timeout) => {
                        warn!(txn = %txn, node = %node, "prepare timed out, counting as abort");
                        Vote::Abort
                    }
                    Err(e) => {
                        warn!(txn = %txn, node = %node, error = %e, "prepare failed, counting as abort");
                        Vote::Abort
                    }
                };
                (node, vote)
            }
        });
        let votes = join_all(requests).await;

        let decision = if votes.iter().all(|(_, v)| v.is_commit()) {
            Decision::Commit
        } else {
            Decision::Abort
        };
        entry.view.lock().votes.extend(votes);
        info!(txn = %txn, %decision, "votes collected");
        Ok(decision)
    }

    /// Logs the decision and moves to COMMITTING or ABORTING.
    pub fn decide(&self, txn: TxnId, decision: Decision) -> TxnResult<()> {
        let entry = self.entry(txn)?;
        if let Some(existing) = entry.view.lock().decision {
            if existing == decision {
                return Ok(());
            }
            return Err(TxnError::InvalidState {
                txn,
                state: CoordinatorState::deciding(existing).to_string(),
                expected: "undecided",
            });
        }

        self.wal
            .append(txn, Role::Coordinator, LogPayload::Decision { decision })?;
        entry.view.lock().decision = Some(decision);
        entry.transition(txn, CoordinatorState::deciding(decision))?;
        info!(txn = %txn, %decision, "decision logged");
        Ok(())
    }

    /// Delivers the decision to every participant that has not
    /// acknowledged it yet, then logs END.
    ///
    /// Retries without bound; returns an error only if the node shuts down
    /// first.
    pub async fn disseminate(&self, txn: TxnId) -> TxnResult<()> {
        let entry = self.entry(txn)?;
        let (decision, pending) = {
            let view = entry.view.lock();
            let pending: Vec<NodeId> = view
                .participants
                .iter()
                .copied()
                .filter(|p| !view.acked.contains(p))
                .collect();
            (view.decision, pending)
        };
        let Some(decision) = decision else {
            return Err(TxnError::InvalidState {
                txn,
                state: entry.state().to_string(),
                expected: "COMMITTING or ABORTING",
            });
        };

        let deliveries = pending.into_iter().map(|node| {
            let entry = Arc::clone(&entry);
            async move {
                if self.deliver(txn, node, decision).await {
                    entry.view.lock().acked.insert(node);
                    true
                } else {
                    false
                }
            }
        });
        if !join_all(deliveries).await.into_iter().all(|acked| acked) {
            return Err(TxnError::NodeUnavailable(self.node_id));
        }

        self.wal.append(txn, Role::Coordinator, LogPayload::End)?;
        entry.transition(txn, CoordinatorState::finished(decision))?;
        self.retire(txn, entry);
        info!(txn = %txn, %decision, "transaction finished");
        Ok(())
    }

    /// Sends the decision to one participant until it acknowledges.
    /// Returns false if shutdown interrupted the retries.
    async fn deliver(&self, txn: TxnId, node: NodeId, decision: Decision) -> bool {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            attempt += 1;
            let request = Request::decision(txn, decision);
            match call_timeout(self.transport.as_ref(), node, request, self.config.commit_timeout).await {
                Ok(Response::Ack) => {
                    debug!(txn = %txn, node = %node, attempt, "decision acknowledged");
                    return true;
                }
                Ok(Response::Error { code, message }) => {
                    error!(txn = %txn, node = %node, ?code, reason = %message, "participant refused decision");
                }
                Ok(other) => {
                    warn!(txn = %txn, node = %node, response = ?other, "unexpected decision answer");
                }
                Err(e) => {
                    warn!(txn = %txn, node = %node, attempt, error = %e, "decision not acknowledged, retrying");
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Drives `txn` from its current state to a terminal one.
    pub async fn drive(&self, txn: TxnId) -> TxnResult<Decision> {
        let entry = self.entry(txn)?;

        let decision = match entry.state() {
            CoordinatorState::Init if entry.view.lock().recovered => {
                info!(txn = %txn, "aborting transaction that had not reached prepare");
                Decision::Abort
            }
            CoordinatorState::Init => match self.execute_all(txn).await {
                Ok(()) => self.prepare(txn).await?,
                Err(e) => {
                    warn!(txn = %txn, error = %e, "execution failed, aborting");
                    Decision::Abort
                }
            },
            CoordinatorState::Preparing => self.prepare(txn).await?,
            state => match state.decision() {
                Some(decision) => decision,
                None => {
                    return Err(TxnError::InvalidState {
                        txn,
                        state: state.to_string(),
                        expected: "non-terminal",
                    })
                }
            },
        };

        if entry.state().is_terminal() {
            return Ok(decision);
        }
        self.decide(txn, decision)?;
        self.disseminate(txn).await?;
        Ok(decision)
    }

    /// Begins and drives a transaction to completion.
    pub async fn run(&self, request: &TransactionRequest) -> TxnResult<(TxnId, Decision)> {
        let txn = self.begin(request)?;
        let decision = self.drive(txn).await?;
        Ok((txn, decision))
    }

    /// Drives `txn` on a background task.
    pub fn spawn_drive(self: &Arc<Self>, txn: TxnId) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.drive(txn).await {
                warn!(txn = %txn, error = %e, "transaction left unfinished");
            }
        });
    }

    /// Waits until `txn` reaches COMMITTED or ABORTED.
    pub async fn wait_terminal(&self, txn: TxnId) -> TxnResult<CoordinatorState> {
        let mut rx = self.entry(txn)?.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                return Err(TxnError::NotFound(txn));
            }
        }
    }

    /// Answers a participant asking for the outcome of `txn`.
    ///
    /// A transaction this node coordinates but has no record of never
    /// reached prepare, so it is reported aborted.
    pub fn query_outcome(&self, txn: TxnId) -> Outcome {
        match self.lookup(txn) {
            Some(entry) => Outcome::from(entry.view.lock().decision),
            None if txn.coordinator() == self.node_id => Outcome::Abort,
            None => Outcome::Unknown,
        }
    }

    /// Returns the state of `txn`.
    pub fn state(&self, txn: TxnId) -> Option<CoordinatorState> {
        self.lookup(txn).map(|e| e.state())
    }

    /// Returns the global status of `txn`.
    pub fn status(&self, txn: TxnId) -> Option<TxnStatusReport> {
        let entry = self.lookup(txn)?;
        Some(Self::report(txn, &entry))
    }

    fn report(txn: TxnId, entry: &TxnEntry) -> TxnStatusReport {
        let view = entry.view.lock();
        let mut report = TxnStatusReport::new(txn);
        report.coordinator_state = Some(entry.state());
        report.decision = view.decision;
        report.participants = view.participants.clone();
        report.votes = view
            .participants
            .iter()
            .map(|&node| VoteRecord {
                node,
                vote: view.votes.get(&node).copied(),
                acked: view.acked.contains(&node),
            })
            .collect();
        report.created_at_ms = view.created_at_ms;
        report
    }

    /// Lists the most recent transactions, newest first.
    pub fn list_transactions(&self, limit: usize) -> Vec<TxnStatusReport> {
        let mut entries: Vec<(TxnId, Arc<TxnEntry>)> = self
            .txns
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        entries.extend(
            self.finished
                .lock()
                .newest()
                .take(limit)
                .map(|(txn, entry)| (txn, Arc::clone(entry))),
        );
        entries.sort_by_key(|(txn, _)| std::cmp::Reverse(txn.sequence()));
        entries.dedup_by_key(|(txn, _)| *txn);
        entries
            .into_iter()
            .take(limit)
            .map(|(txn, entry)| Self::report(txn, &entry))
            .collect()
    }

    /// Returns how many transactions are not finished.
    pub fn open_count(&self) -> usize {
        self.txns.iter().filter(|e| !e.value().state().is_terminal()).count()
    }

    /// Rebuilds coordinator views from a recovery plan and returns the
    /// transactions that still need driving.
    pub fn recover(&self, plan: &RecoveryPlan) -> Vec<TxnId> {
        if let Some(max) = plan.max_sequence() {
            self.next_sequence.fetch_max(max + 1, Ordering::SeqCst);
        }

        let mut pending = Vec::new();
        for c in &plan.coordinator {
            let state = c.state();
            let mut view = GlobalTxn {
                participants: c.participants.clone(),
                operations: Vec::new(),
                operation_counts: c.operation_counts.clone(),
                votes: BTreeMap::new(),
                acked: BTreeSet::new(),
                decision: c.decision,
                recovered: true,
                created_at_ms: unix_millis(),
            };
            if let CoordinatorAction::Finished(_) = c.action {
                view.acked = c.participants.iter().copied().collect();
                self.finished.lock().insert(c.txn, TxnEntry::new(view, state));
            } else {
                info!(txn = %c.txn, %state, action = ?c.action, "resuming transaction");
                pending.push(c.txn);
                self.txns.insert(c.txn, TxnEntry::new(view, state));
            }
        }
        pending
    }
}
