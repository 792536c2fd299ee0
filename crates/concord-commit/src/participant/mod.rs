//! Participant side of two-phase commit.
//!
//! A participant executes a transaction's local operations under strict
//! two-phase locking, logs each applied operation with its undo and redo
//! images, votes on PREPARE and applies the coordinator's decision.
//!
//! Requests for the same transaction are serialized through a per
//! transaction work lock, so a transaction's local view is only ever
//! changed by one request at a time. Status queries read the view without
//! waiting for that lock.
//!
//! Before voting a participant may abort on its own. The resolver does so
//! for a transaction that sat idle past `active_timeout` if its coordinator
//! is unreachable or has not decided.
//!
//! Once it voted commit, a participant never decides on its own. If the
//! decision does not arrive, the resolver asks the coordinator and, when
//! cooperative termination is enabled, the other participants. A peer can
//! only answer with an outcome it already knows, or abort if it has not
//! voted yet. Without an answer the transaction stays blocked with its
//! locks held.
//!
//! Finished transactions leave the live table. A bounded history keeps
//! their outcome for late or repeated requests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use concord_common::config::TimeoutConfig;
use concord_common::constants::DEFAULT_RETAINED_TRANSACTIONS;
use concord_common::error::ErrorCode;
use concord_common::types::{Access, Decision, NodeId, TxnId, Vote};
use concord_txn::{LockManager, LockMode, LockResult, Operation, ResourceId, ResourceManager};
use concord_wal::{LogPayload, OperationPayload, Role, Wal};

use crate::error::{TxnError, TxnResult};
use crate::history::History;
use crate::protocol::{Outcome, Request, Response, TxnStatusReport};
use crate::recovery::{ParticipantAction, RecoveryPlan};
use crate::state::ParticipantState;
use crate::transport::{call_timeout, Transport};
use crate::unix_millis;

/// Participant tuning.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// Bound on each lock wait.
    pub lock_timeout: Duration,
    /// How long a prepared transaction waits before asking for the outcome.
    pub query_interval: Duration,
    /// Bound on each outcome query.
    pub query_timeout: Duration,
    /// Ask fellow participants when the coordinator cannot answer.
    pub cooperative_termination: bool,
    /// Idle time after which an unvoted transaction checks with its
    /// coordinator.
    pub active_timeout: Duration,
    /// Finished transactions remembered after they leave the live table.
    pub retained: usize,
}

impl ParticipantConfig {
    /// Derives the participant settings from the node's timeouts.
    pub fn from_timeouts(timeouts: &TimeoutConfig, cooperative_termination: bool) -> Self {
        Self {
            lock_timeout: timeouts.lock_timeout(),
            query_interval: timeouts.outcome_query_interval(),
            query_timeout: timeouts.commit_timeout(),
            cooperative_termination,
            active_timeout: timeouts.active_idle_timeout(),
            retained: DEFAULT_RETAINED_TRANSACTIONS,
        }
    }
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self::from_timeouts(&TimeoutConfig::default(), true)
    }
}

/// Local view of one transaction.
#[derive(Debug, Clone)]
struct LocalTxn {
    coordinator: NodeId,
    participants: Vec<NodeId>,
    state: ParticipantState,
    writes: Vec<OperationPayload>,
    operations: u32,
    last_active: Instant,
    prepared_at: Option<Instant>,
    recovered: bool,
    blocked: bool,
    created_at_ms: u64,
}

impl LocalTxn {
    fn new(txn: TxnId, state: ParticipantState) -> Self {
        Self {
            coordinator: txn.coordinator(),
            participants: Vec::new(),
            state,
            writes: Vec::new(),
            operations: 0,
            last_active: Instant::now(),
            prepared_at: None,
            recovered: false,
            blocked: false,
            created_at_ms: unix_millis(),
        }
    }

    fn written_resources(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.writes.iter().map(|w| w.resource.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }
}

/// A transaction's work lock and its view.
#[derive(Debug)]
struct TxnSlot {
    work: TokioMutex<()>,
    view: Mutex<LocalTxn>,
}

impl TxnSlot {
    fn new(view: LocalTxn) -> Arc<Self> {
        Arc::new(Self {
            work: TokioMutex::new(()),
            view: Mutex::new(view),
        })
    }

    fn state(&self) -> ParticipantState {
        self.view.lock().state
    }

    fn check(&self, txn: TxnId, next: ParticipantState) -> TxnResult<()> {
        let current = self.state();
        if current == next || current.can_transition_to(next) {
            Ok(())
        } else {
            Err(TxnError::InvalidState {
                txn,
                state: current.to_string(),
                expected: "an earlier state",
            })
        }
    }

    /// Moves the view forward. The caller holds the work lock.
    fn transition(&self, txn: TxnId, next: ParticipantState) -> TxnResult<()> {
        self.check(txn, next)?;
        let mut view = self.view.lock();
        let current = view.state;
        view.state = next;
        match next {
            ParticipantState::Prepared => view.prepared_at = Some(Instant::now()),
            ParticipantState::Committed | ParticipantState::Aborted => view.blocked = false,
            ParticipantState::Active => {}
        }
        debug!(txn = %txn, from = %current, to = %next, "participant state change");
        Ok(())
    }
}

/// Executes operations, votes and applies decisions on one node.
pub struct Participant {
    node_id: NodeId,
    wal: Arc<Wal>,
    locks: Arc<LockManager>,
    store: Arc<dyn ResourceManager>,
    config: ParticipantConfig,
    txns: DashMap<TxnId, Arc<TxnSlot>>,
    finished: Mutex<History<LocalTxn>>,
    reject_prepare: AtomicBool,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("node_id", &self.node_id)
            .field("transactions", &self.txns.len())
            .field("finished", &self.finished.lock().len())
            .finish()
    }
}

impl Participant {
    /// Creates a participant.
    pub fn new(
        node_id: NodeId,
        wal: Arc<Wal>,
        locks: Arc<LockManager>,
        store: Arc<dyn ResourceManager>,
        config: ParticipantConfig,
    ) -> Self {
        Self {
            node_id,
            wal,
            locks,
            store,
            finished: Mutex::new(History::new(config.retained)),
            config,
            txns: DashMap::new(),
            reject_prepare: AtomicBool::new(false),
        }
    }

    /// Makes every following PREPARE vote abort.
    pub fn set_reject_prepare(&self, reject: bool) {
        self.reject_prepare.store(reject, Ordering::Release);
    }

    /// Returns the resource manager.
    pub fn store(&self) -> &Arc<dyn ResourceManager> {
        &self.store
    }

    /// Returns the lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Live slot of `txn`, or a detached terminal one rebuilt from the
    /// history.
    fn slot(&self, txn: TxnId) -> Option<Arc<TxnSlot>> {
        if let Some(slot) = self.txns.get(&txn) {
            return Some(Arc::clone(slot.value()));
        }
        self.finished.lock().get(txn).map(TxnSlot::new)
    }

    fn slot_or_insert(&self, txn: TxnId) -> Arc<TxnSlot> {
        match self.txns.entry(txn) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => match self.finished.lock().get(txn) {
                Some(view) => TxnSlot::new(view),
                None => Arc::clone(
                    e.insert(TxnSlot::new(LocalTxn::new(txn, ParticipantState::Active)))
                        .value(),
                ),
            },
        }
    }

    /// Moves a terminal transaction from the live table to the history.
    fn retire(&self, txn: TxnId, mut view: LocalTxn) {
        view.writes.clear();
        view.blocked = false;
        let evicted = match self.txns.entry(txn) {
            Entry::Occupied(e) => {
                let evicted = self.finished.lock().insert(txn, view);
                e.remove();
                evicted
            }
            Entry::Vacant(_) => self.finished.lock().insert(txn, view),
        };
        self.locks.forget(txn);
        if evicted > 0 {
            debug!(txn = %txn, evicted, "dropped oldest finished transactions");
        }
    }

    fn retire_slot(&self, txn: TxnId, slot: &TxnSlot) {
        let view = slot.view.lock().clone();
        self.retire(txn, view);
    }

    /// Executes one operation of `txn`.
    ///
    /// The first operation of an unknown transaction enlists it locally.
    /// Any failure aborts the transaction here before the error is
    /// returned.
    pub async fn execute(&self, txn: TxnId, op: Operation) -> TxnResult<Option<i64>> {
        let slot = self.slot_or_insert(txn);
        let _work = slot.work.lock().await;

        let state = slot.state();
        if state != ParticipantState::Active {
            return Err(TxnError::InvalidState {
                txn,
                state: state.to_string(),
                expected: "ACTIVE",
            });
        }

        let resource = ResourceId::new(op.resource.as_str());
        if let Err(e) = self
            .locks
            .acquire(txn, &resource, op.lock_mode(), Some(self.config.lock_timeout))
            .await
        {
            warn!(txn = %txn, op = %op, error = %e, "lock not granted, aborting");
            self.abort_locally(txn, &slot)?;
            return Err(TxnError::from_lock(e));
        }

        let applied = match self.store.apply(&op) {
            Ok(applied) => applied,
            Err(source) => {
                warn!(txn = %txn, op = %op, error = %source, "operation failed, aborting");
                self.abort_locally(txn, &slot)?;
                return Err(TxnError::Resource { txn, source });
            }
        };

        let payload = OperationPayload {
            resource: op.resource.clone(),
            access: op.access(),
            before: applied.before,
            after: applied.after,
        };
        if let Err(e) = self
            .wal
            .append(txn, Role::Participant, LogPayload::Operation(payload.clone()))
        {
            error!(txn = %txn, error = %e, "failed to log operation");
            self.store.restore(&op.resource, applied.before);
            self.abort_locally(txn, &slot)?;
            return Err(e.into());
        }

        let mut view = slot.view.lock();
        view.operations += 1;
        view.last_active = Instant::now();
        if payload.access == Access::Write {
            view.writes.push(payload);
        }
        debug!(txn = %txn, op = %op, value = ?applied.value(), "executed");
        Ok(applied.value())
    }

    /// Undoes the transaction's writes, logs the abort and releases its
    /// locks. The caller holds the work lock.
    fn abort_locally(&self, txn: TxnId, slot: &TxnSlot) -> TxnResult<()> {
        self.finish_abort(txn, slot, LogPayload::Decision {
            decision: Decision::Abort,
        })
    }

    fn finish_abort(&self, txn: TxnId, slot: &TxnSlot, record: LogPayload) -> TxnResult<()> {
        slot.check(txn, ParticipantState::Aborted)?;
        let writes = slot.view.lock().writes.clone();
        for write in writes.iter().rev() {
            self.store.restore(&write.resource, write.before);
        }
        let logged = self.wal.append(txn, Role::Participant, record);
        slot.transition(txn, ParticipantState::Aborted)?;
        let released = self.locks.release_all(txn);
        self.retire_slot(txn, slot);
        info!(txn = %txn, undone = writes.len(), released, "aborted locally");
        logged.map(|_| ()).map_err(TxnError::from)
    }

    /// Answers PREPARE.
    ///
    /// Votes commit only if every operation the coordinator sent was
    /// applied here and local constraints hold; the vote is durable before
    /// this returns. A repeated PREPARE gets the same answer.
    pub async fn on_prepare(&self, txn: TxnId, participants: Vec<NodeId>, operations: u32) -> Vote {
        let slot = match self.slot(txn) {
            Some(slot) => slot,
            None if operations == 0 => self.slot_or_insert(txn),
            None => {
                warn!(txn = %txn, operations, "prepare for unknown transaction, voting abort");
                let record = LogPayload::Vote {
                    vote: Vote::Abort,
                    coordinator: txn.coordinator(),
                    participants: participants.clone(),
                };
                if let Err(e) = self.wal.append(txn, Role::Participant, record) {
                    error!(txn = %txn, error = %e, "failed to log abort vote");
                }
                let mut view = LocalTxn::new(txn, ParticipantState::Aborted);
                view.participants = participants;
                self.retire(txn, view);
                return Vote::Abort;
            }
        };
        let _work = slot.work.lock().await;

        match slot.state() {
            ParticipantState::Prepared | ParticipantState::Committed => return Vote::Commit,
            ParticipantState::Aborted => return Vote::Abort,
            ParticipantState::Active => {}
        }

        let (executed, written) = {
            let mut view = slot.view.lock();
            view.participants = participants.clone();
            (view.operations, view.written_resources())
        };

        let refusal = if self.reject_prepare.load(Ordering::Acquire) {
            Some("rejecting prepare requests".to_string())
        } else if executed != operations {
            Some(format!("executed {} of {} operations", executed, operations))
        } else {
            self.store.validate(&written).err().map(|e| e.to_string())
        };

        if let Some(reason) = refusal {
            return self.vote_abort(txn, &slot, participants, &reason);
        }

        let record = LogPayload::Vote {
            vote: Vote::Commit,
            coordinator: txn.coordinator(),
            participants: participants.clone(),
        };
        if let Err(e) = self.wal.append(txn, Role::Participant, record) {
            return self.vote_abort(txn, &slot, participants, &e.to_string());
        }

        if let Err(e) = slot.transition(txn, ParticipantState::Prepared) {
            // The vote is logged; only recovery can reconcile the view now.
            error!(txn = %txn, error = %e, "voted commit from an unexpected state");
        }
        info!(txn = %txn, "voted commit");
        Vote::Commit
    }

    fn vote_abort(
        &self,
        txn: TxnId,
        slot: &TxnSlot,
        participants: Vec<NodeId>,
        reason: &str,
    ) -> Vote {
        info!(txn = %txn, reason, "voting abort");
        let record = LogPayload::Vote {
            vote: Vote::Abort,
            coordinator: txn.coordinator(),
            participants,
        };
        if let Err(e) = self.finish_abort(txn, slot, record) {
            error!(txn = %txn, error = %e, "failed to log abort vote");
        }
        Vote::Abort
    }

    /// Applies a commit decision.
    pub async fn on_commit(&self, txn: TxnId) -> TxnResult<()> {
        let Some(slot) = self.slot(txn) else {
            warn!(txn = %txn, "commit for unknown transaction");
            return Ok(());
        };
        let _work = slot.work.lock().await;

        match slot.state() {
            ParticipantState::Committed => Ok(()),
            ParticipantState::Prepared => {
                self.wal.append(
                    txn,
                    Role::Participant,
                    LogPayload::Decision {
                        decision: Decision::Commit,
                    },
                )?;
                slot.transition(txn, ParticipantState::Committed)?;
                let released = self.locks.release_all(txn);
                self.retire_slot(txn, &slot);
                info!(txn = %txn, released, "committed");
                Ok(())
            }
            state => {
                error!(txn = %txn, %state, "commit decision does not match local state");
                Err(TxnError::InvalidState {
                    txn,
                    state: state.to_string(),
                    expected: "PREPARED",
                })
            }
        }
    }

    /// Applies an abort decision.
    pub async fn on_abort(&self, txn: TxnId) -> TxnResult<()> {
        let slot = match self.slot(txn) {
            Some(slot) => slot,
            None => {
                // Remember the outcome so a late PREPARE votes abort.
                self.retire(txn, LocalTxn::new(txn, ParticipantState::Aborted));
                self.wal.append(
                    txn,
                    Role::Participant,
                    LogPayload::Decision {
                        decision: Decision::Abort,
                    },
                )?;
                debug!(txn = %txn, "abort for unknown transaction");
                return Ok(());
            }
        };
        let _work = slot.work.lock().await;

        match slot.state() {
            ParticipantState::Aborted => Ok(()),
            ParticipantState::Active | ParticipantState::Prepared => self.abort_locally(txn, &slot),
            ParticipantState::Committed => {
                error!(txn = %txn, "abort decision for a committed transaction");
                Err(TxnError::InvalidState {
                    txn,
                    state: ParticipantState::Committed.to_string(),
                    expected: "ACTIVE or PREPARED",
                })
            }
        }
    }

    /// Answers a fellow participant's outcome query.
    ///
    /// A transaction that has not voted here is aborted first; it can no
    /// longer commit.
    pub async fn known_outcome(&self, txn: TxnId) -> TxnResult<Outcome> {
        let slot = self.slot(txn);
        let state = slot.as_ref().map(|s| s.state());
        match state {
            Some(ParticipantState::Committed) => Ok(Outcome::Commit),
            Some(ParticipantState::Aborted) => Ok(Outcome::Abort),
            Some(ParticipantState::Prepared) => Ok(Outcome::Unknown),
            Some(ParticipantState::Active) | None => {
                self.on_abort(txn).await?;
                Ok(self
                    .slot(txn)
                    .map(|s| Outcome::from(s.state().decision()))
                    .unwrap_or(Outcome::Abort))
            }
        }
    }

    /// Rebuilds the local views from a recovery plan.
    ///
    /// The plan's resource images must already be installed.
    pub fn recover(&self, plan: &RecoveryPlan) -> TxnResult<()> {
        for p in &plan.participant {
            let mut view = LocalTxn::new(p.txn, p.state);
            view.coordinator = p.coordinator;
            view.participants = p.participants.clone();
            view.writes = p.writes.clone();
            view.operations = p.operations;

            match p.action {
                ParticipantAction::None => {
                    if p.state.is_terminal() {
                        self.retire(p.txn, view);
                        continue;
                    }
                }
                ParticipantAction::AbortUnilaterally => {
                    self.wal.append(
                        p.txn,
                        Role::Participant,
                        LogPayload::Decision {
                            decision: Decision::Abort,
                        },
                    )?;
                    info!(txn = %p.txn, "aborted unvoted transaction after restart");
                    self.retire(p.txn, view);
                    continue;
                }
                ParticipantAction::ResolveInDoubt => {
                    for resource in view.written_resources() {
                        let resource = ResourceId::new(resource);
                        match self.locks.try_acquire(p.txn, &resource, LockMode::Exclusive) {
                            Ok(LockResult::WouldBlock) | Err(_) => {
                                error!(txn = %p.txn, resource = %resource, "could not re-acquire lock");
                            }
                            Ok(_) => {}
                        }
                    }
                    view.prepared_at = Some(Instant::now());
                    view.recovered = true;
                    warn!(txn = %p.txn, coordinator = %p.coordinator, "transaction in doubt after restart");
                }
            }
            self.txns.insert(p.txn, TxnSlot::new(view));
        }
        Ok(())
    }

    /// Makes one attempt to learn the outcome of every transaction that
    /// has been in doubt for at least `min_age`, or since a restart.
    /// Returns how many were resolved.
    pub async fn resolve_in_doubt(&self, transport: &dyn Transport, min_age: Duration) -> usize {
        let candidates: Vec<(TxnId, NodeId, Vec<NodeId>)> = self
            .txns
            .iter()
            .filter_map(|entry| {
                let view = entry.value().view.lock();
                let due = view.recovered
                    || view
                        .prepared_at
                        .map_or(false, |t| t.elapsed() >= min_age);
                if view.state == ParticipantState::Prepared && due {
                    Some((*entry.key(), view.coordinator, view.participants.clone()))
                } else {
                    None
                }
            })
            .collect();

        let mut resolved = 0;
        for (txn, coordinator, participants) in candidates {
            let decision = match self.ask(transport, coordinator, Request::QueryOutcome { txn }).await {
                Ok(Outcome::Unknown) => {
                    debug!(txn = %txn, "coordinator has not decided yet");
                    self.mark_blocked(txn, false);
                    continue;
                }
                Ok(outcome) => outcome.decision(),
                Err(e) => {
                    debug!(txn = %txn, coordinator = %coordinator, error = %e, "outcome query failed");
                    if self.config.cooperative_termination {
                        self.ask_peers(transport, txn, &participants).await
                    } else {
                        None
                    }
                }
            };

            let Some(decision) = decision else {
                warn!(txn = %txn, coordinator = %coordinator, "transaction blocked: no one knows the outcome");
                self.mark_blocked(txn, true);
                continue;
            };

            let applied = match decision {
                Decision::Commit => self.on_commit(txn).await,
                Decision::Abort => self.on_abort(txn).await,
            };
            match applied {
                Ok(()) => {
                    info!(txn = %txn, %decision, "resolved in-doubt transaction");
                    resolved += 1;
                }
                Err(e) => error!(txn = %txn, error = %e, "failed to apply resolved outcome"),
            }
        }
        resolved
    }

    /// Aborts unvoted transactions idle for at least `idle` whose
    /// coordinator is unreachable or has not committed them. Returns how
    /// many were aborted.
    pub async fn abort_abandoned(&self, transport: &dyn Transport, idle: Duration) -> usize {
        let candidates: Vec<(TxnId, NodeId, Instant)> = self
            .txns
            .iter()
            .filter_map(|entry| {
                let view = entry.value().view.lock();
                if view.state == ParticipantState::Active && view.last_active.elapsed() >= idle {
                    Some((*entry.key(), view.coordinator, view.last_active))
                } else {
                    None
                }
            })
            .collect();

        let mut aborted = 0;
        for (txn, coordinator, seen) in candidates {
            match self.ask(transport, coordinator, Request::QueryOutcome { txn }).await {
                Ok(Outcome::Commit) => {
                    error!(txn = %txn, "coordinator reports commit for a transaction that never voted");
                    continue;
                }
                Ok(outcome) => debug!(txn = %txn, ?outcome, "idle transaction not committed"),
                Err(e) => {
                    debug!(txn = %txn, coordinator = %coordinator, error = %e, "coordinator unreachable for idle transaction");
                }
            }

            let Some(slot) = self.txns.get(&txn).map(|s| Arc::clone(s.value())) else {
                continue;
            };
            let _work = slot.work.lock().await;
            let untouched = {
                let view = slot.view.lock();
                view.state == ParticipantState::Active && view.last_active == seen
            };
            if !untouched {
                continue;
            }

            warn!(
                txn = %txn,
                coordinator = %coordinator,
                idle_ms = seen.elapsed().as_millis() as u64,
                "aborting abandoned transaction"
            );
            match self.abort_locally(txn, &slot) {
                Ok(()) => aborted += 1,
                Err(e) => error!(txn = %txn, error = %e, "failed to abort abandoned transaction"),
            }
        }
        aborted
    }

    async fn ask(&self, transport: &dyn Transport, to: NodeId, request: Request) -> TxnResult<Outcome> {
        let response = call_timeout(transport, to, request, self.config.query_timeout).await?;
        match response.into_result()? {
            Response::Outcome { outcome } => Ok(outcome),
            other => Err(TxnError::Remote {
                code: ErrorCode::Internal,
                message: format!("unexpected response {:?}", other),
            }),
        }
    }

    /// Cooperative termination: any peer that knows the outcome may tell.
    async fn ask_peers(
        &self,
        transport: &dyn Transport,
        txn: TxnId,
        participants: &[NodeId],
    ) -> Option<Decision> {
        for &peer in participants.iter().filter(|&&p| p != self.node_id) {
            match self.ask(transport, peer, Request::PeerOutcome { txn }).await {
                Ok(outcome) => {
                    if let Some(decision) = outcome.decision() {
                        info!(txn = %txn, peer = %peer, %decision, "outcome learned from peer");
                        return Some(decision);
                    }
                }
                Err(e) => debug!(txn = %txn, peer = %peer, error = %e, "peer query failed"),
            }
        }
        None
    }

    fn mark_blocked(&self, txn: TxnId, blocked: bool) {
        if let Some(slot) = self.slot(txn) {
            slot.view.lock().blocked = blocked;
        }
    }

    /// Runs the in-doubt resolver and the idle sweep until `shutdown` fires.
    pub async fn run_resolver(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.query_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.resolve_in_doubt(transport.as_ref(), self.config.query_interval).await;
                    self.abort_abandoned(transport.as_ref(), self.config.active_timeout).await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Returns the local state of `txn`.
    pub fn state(&self, txn: TxnId) -> Option<ParticipantState> {
        self.slot(txn).map(|s| s.state())
    }

    /// Returns the local status report of `txn`.
    pub fn status(&self, txn: TxnId) -> Option<TxnStatusReport> {
        let slot = self.slot(txn)?;
        let view = slot.view.lock();
        let mut report = TxnStatusReport::new(txn);
        report.participant_state = Some(view.state);
        report.decision = view.state.decision();
        report.participants = view.participants.clone();
        report.created_at_ms = view.created_at_ms;
        report.blocked = view.blocked;
        Some(report)
    }

    /// Returns how many transactions are not terminal here.
    pub fn open_count(&self) -> usize {
        self.txns.iter().filter(|e| !e.value().state().is_terminal()).count()
    }

    /// Returns how many transactions are prepared and waiting.
    pub fn in_doubt_count(&self) -> usize {
        self.txns
            .iter()
            .filter(|e| e.value().state() == ParticipantState::Prepared)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_txn::{LockManagerConfig, MemoryStore};
    use concord_wal::{SyncPolicy, WalConfig};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn txn(seq: u64) -> TxnId {
        TxnId::compose(NodeId::new(1), seq)
    }

    fn participant(dir: &TempDir) -> Participant {
        participant_with(
            dir,
            ParticipantConfig {
                lock_timeout: Duration::from_millis(50),
                ..ParticipantConfig::default()
            },
        )
    }

    fn participant_with(dir: &TempDir, config: ParticipantConfig) -> Participant {
        let wal = Wal::open(WalConfig::new(dir.path()).with_sync_policy(SyncPolicy::Never)).unwrap();
        let mut seed = BTreeMap::new();
        seed.insert("alice".to_string(), 100);
        seed.insert("bob".to_string(), 20);
        Participant::new(
            NodeId::new(2),
            Arc::new(wal),
            Arc::new(LockManager::with_config(LockManagerConfig::new(
                Duration::from_millis(50),
            ))),
            Arc::new(MemoryStore::with_accounts(seed)),
            config,
        )
    }

    #[tokio::test]
    async fn test_execute_prepare_commit() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        let t = txn(1);

        assert_eq!(p.execute(t, Operation::add("alice", -30)).await.unwrap(), Some(70));
        assert_eq!(p.state(t), Some(ParticipantState::Active));
        assert_eq!(p.locks().locks_of(t).len(), 1);

        assert_eq!(p.on_prepare(t, vec![NodeId::new(2)], 1).await, Vote::Commit);
        assert_eq!(p.state(t), Some(ParticipantState::Prepared));
        // A repeated prepare gets the same vote.
        assert_eq!(p.on_prepare(t, vec![NodeId::new(2)], 1).await, Vote::Commit);

        p.on_commit(t).await.unwrap();
        assert_eq!(p.state(t), Some(ParticipantState::Committed));
        assert_eq!(p.store().read("alice").unwrap(), 70);
        assert!(p.locks().locks_of(t).is_empty());
        p.on_commit(t).await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_balance_votes_abort_and_undoes() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        let t = txn(2);

        p.execute(t, Operation::add("bob", -50)).await.unwrap();
        assert_eq!(p.on_prepare(t, vec![NodeId::new(2)], 1).await, Vote::Abort);
        assert_eq!(p.state(t), Some(ParticipantState::Aborted));
        assert_eq!(p.store().read("bob").unwrap(), 20);
        assert!(p.locks().locks_of(t).is_empty());

        // The abort decision that follows is acknowledged.
        p.on_abort(t).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_operation_votes_abort() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        let t = txn(3);

        p.execute(t, Operation::add("alice", 5)).await.unwrap();
        assert_eq!(p.on_prepare(t, vec![], 2).await, Vote::Abort);
        assert_eq!(p.store().read("alice").unwrap(), 100);

        // Unknown transaction that should have work here.
        assert_eq!(p.on_prepare(txn(4), vec![], 1).await, Vote::Abort);
        // Unknown transaction with no work here.
        assert_eq!(p.on_prepare(txn(5), vec![], 0).await, Vote::Commit);
    }

    #[tokio::test]
    async fn test_reject_prepare() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        p.set_reject_prepare(true);
        p.execute(txn(6), Operation::read("alice")).await.unwrap();
        assert_eq!(p.on_prepare(txn(6), vec![], 1).await, Vote::Abort);
    }

    #[tokio::test]
    async fn test_lock_timeout_aborts_waiter() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);

        p.execute(txn(7), Operation::add("alice", -10)).await.unwrap();
        p.execute(txn(8), Operation::add("bob", 1)).await.unwrap();
        let err = p.execute(txn(8), Operation::read("alice")).await.unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));

        assert_eq!(p.state(txn(8)), Some(ParticipantState::Aborted));
        assert_eq!(p.store().read("bob").unwrap(), 20);
        assert!(p.locks().locks_of(txn(8)).is_empty());

        // Further work for an aborted transaction is refused.
        let err = p.execute(txn(8), Operation::read("bob")).await.unwrap_err();
        assert!(matches!(err, TxnError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_resource_error_aborts() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);

        p.execute(txn(9), Operation::add("alice", 1)).await.unwrap();
        let err = p.execute(txn(9), Operation::add("nobody", 1)).await.unwrap_err();
        assert!(matches!(err, TxnError::Resource { .. }));
        assert_eq!(p.state(txn(9)), Some(ParticipantState::Aborted));
        assert_eq!(p.store().read("alice").unwrap(), 100);
    }

    #[tokio::test]
    async fn test_abort_for_unknown_then_late_prepare() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);

        p.on_abort(txn(10)).await.unwrap();
        assert_eq!(p.on_prepare(txn(10), vec![], 0).await, Vote::Abort);
        let err = p.execute(txn(10), Operation::read("alice")).await.unwrap_err();
        assert!(matches!(err, TxnError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_known_outcome() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);

        p.execute(txn(11), Operation::add("alice", -1)).await.unwrap();
        // Not voted yet: the peer's question aborts it.
        assert_eq!(p.known_outcome(txn(11)).await.unwrap(), Outcome::Abort);
        assert_eq!(p.store().read("alice").unwrap(), 100);

        p.execute(txn(12), Operation::add("alice", -1)).await.unwrap();
        p.on_prepare(txn(12), vec![], 1).await;
        assert_eq!(p.known_outcome(txn(12)).await.unwrap(), Outcome::Unknown);
        p.on_commit(txn(12)).await.unwrap();
        assert_eq!(p.known_outcome(txn(12)).await.unwrap(), Outcome::Commit);
    }

    #[tokio::test]
    async fn test_status_report() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        assert!(p.status(txn(13)).is_none());

        p.execute(txn(13), Operation::read("bob")).await.unwrap();
        let report = p.status(txn(13)).unwrap();
        assert_eq!(report.participant_state, Some(ParticipantState::Active));
        assert!(!report.is_terminal());
        assert_eq!(p.open_count(), 1);
        assert_eq!(p.in_doubt_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_transactions_leave_live_table() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);

        for seq in 20..30 {
            p.execute(txn(seq), Operation::add("alice", 1)).await.unwrap();
            assert_eq!(p.on_prepare(txn(seq), vec![NodeId::new(2)], 1).await, Vote::Commit);
            p.on_commit(txn(seq)).await.unwrap();
        }
        p.execute(txn(30), Operation::add("bob", -1)).await.unwrap();
        p.on_abort(txn(30)).await.unwrap();

        assert!(p.txns.is_empty());
        assert_eq!(p.locks().shrinking_count(), 0);
        assert_eq!(p.store().read("alice").unwrap(), 110);

        // Finished transactions still answer repeated and late requests.
        assert_eq!(p.state(txn(20)), Some(ParticipantState::Committed));
        p.on_commit(txn(20)).await.unwrap();
        assert_eq!(p.on_prepare(txn(20), vec![], 1).await, Vote::Commit);
        assert_eq!(p.known_outcome(txn(20)).await.unwrap(), Outcome::Commit);
        assert!(p.on_abort(txn(20)).await.is_err());
        let err = p.execute(txn(20), Operation::read("alice")).await.unwrap_err();
        assert!(matches!(err, TxnError::InvalidState { .. }));

        p.on_abort(txn(30)).await.unwrap();
        assert_eq!(p.on_prepare(txn(30), vec![], 1).await, Vote::Abort);
        assert!(p.txns.is_empty());
    }

    #[tokio::test]
    async fn test_finished_history_is_bounded() {
        let dir = TempDir::new().unwrap();
        let p = participant_with(
            &dir,
            ParticipantConfig {
                retained: 4,
                ..ParticipantConfig::default()
            },
        );

        for seq in 40..50 {
            p.on_abort(txn(seq)).await.unwrap();
        }
        assert_eq!(p.finished.lock().len(), 4);
        assert_eq!(p.state(txn(49)), Some(ParticipantState::Aborted));
        assert_eq!(p.state(txn(40)), None);
    }

    #[test]
    fn test_slot_transitions_only_move_forward() {
        let t = txn(60);
        let slot = TxnSlot::new(LocalTxn::new(t, ParticipantState::Active));
        slot.transition(t, ParticipantState::Prepared).unwrap();
        assert!(slot.view.lock().prepared_at.is_some());
        slot.transition(t, ParticipantState::Prepared).unwrap();
        slot.transition(t, ParticipantState::Committed).unwrap();

        let err = slot.transition(t, ParticipantState::Aborted).unwrap_err();
        assert!(matches!(err, TxnError::InvalidState { .. }));
        assert_eq!(slot.state(), ParticipantState::Committed);

        let fresh = TxnSlot::new(LocalTxn::new(t, ParticipantState::Active));
        assert!(fresh.transition(t, ParticipantState::Committed).is_err());
    }

    #[tokio::test]
    async fn test_idle_transaction_aborted_without_coordinator() {
        let dir = TempDir::new().unwrap();
        let p = participant(&dir);
        // Nothing is registered for node 1, the coordinator of `txn`.
        let network = crate::transport::MemoryNetwork::shared();
        let transport = network.transport(NodeId::new(2));

        p.execute(txn(70), Operation::add("alice", -40)).await.unwrap();
        assert_eq!(p.abort_abandoned(&transport, Duration::from_secs(60)).await, 0);
        assert_eq!(p.state(txn(70)), Some(ParticipantState::Active));

        assert_eq!(p.abort_abandoned(&transport, Duration::ZERO).await, 1);
        assert_eq!(p.state(txn(70)), Some(ParticipantState::Aborted));
        assert_eq!(p.store().read("alice").unwrap(), 100);
        assert!(p.locks().locks_of(txn(70)).is_empty());

        // Prepared transactions are never aborted this way.
        p.execute(txn(71), Operation::add("bob", 5)).await.unwrap();
        p.on_prepare(txn(71), vec![], 1).await;
        assert_eq!(p.abort_abandoned(&transport, Duration::ZERO).await, 0);
        assert_eq!(p.state(txn(71)), Some(ParticipantState::Prepared));
    }
}
