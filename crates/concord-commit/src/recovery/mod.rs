//! Crash recovery planning.
//!
//! [`plan_recovery`] turns the records of a node's log into a
//! [`RecoveryPlan`] without touching any state, so every recovery rule can
//! be tested on hand-built logs. The node then carries the plan out:
//!
//! 1. Reset the volatile store to its seed and install `resource_actions`
//!    in order. Writes are redone in log order; a transaction that aborted
//!    is undone, in reverse, at the position of its abort record, which is
//!    where the undo originally happened while its locks were still held.
//!    Transactions that never voted are undone at the end of the log.
//! 2. Rebuild participant views. In-doubt transactions get their
//!    exclusive locks back and wait for the coordinator's decision.
//! 3. Rebuild coordinator views and resume each unfinished transaction.
//!
//! Images are absolute values, so running the same plan twice from the
//! same seed yields the same state.
//!
//! ```text
//! coordinator, last record    action
//! ─────────────────────────   ─────────────────────────────
//! BEGIN                       decide abort, disseminate
//! PREPARE                     re-drive prepare
//! DECISION                    resume dissemination
//! END                         none
//!
//! participant, last record    action
//! ─────────────────────────   ─────────────────────────────
//! OPERATION (no vote)         abort unilaterally
//! VOTE commit                 in doubt: re-lock, ask coordinator
//! VOTE abort / DECISION       none
//! ```

use std::collections::BTreeMap;

use tracing::debug;

use concord_common::types::{Access, Decision, NodeId, TxnId, Vote};
use concord_txn::ResourceManager;
use concord_wal::{LogPayload, LogRecord, OperationPayload, Role};

use crate::state::{CoordinatorState, ParticipantState};

/// Whether an image re-applies or reverses an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// After-image of a write.
    Redo,
    /// Before-image of a write by an aborted transaction.
    Undo,
}

/// One image to install into the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAction {
    /// Transaction that produced the image.
    pub txn: TxnId,
    /// Resource to set.
    pub resource: String,
    /// Value to install; `None` removes the resource.
    pub image: Option<i64>,
    /// Redo or undo.
    pub kind: ImageKind,
}

/// What a recovering coordinator must do for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Crashed before prepare; decide abort and disseminate it.
    DecideAbort,
    /// Crashed while collecting votes; ask again.
    Reprepare,
    /// Decision logged but not acknowledged by everyone.
    Disseminate(Decision),
    /// Already complete.
    Finished(Decision),
}

/// Rebuilt coordinator view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorRecovery {
    /// The transaction.
    pub txn: TxnId,
    /// Enlisted participants.
    pub participants: Vec<NodeId>,
    /// Operations per participant, known once prepare was logged.
    pub operation_counts: Vec<u32>,
    /// Logged decision, if any.
    pub decision: Option<Decision>,
    /// What to do next.
    pub action: CoordinatorAction,
}

impl CoordinatorRecovery {
    /// State the coordinator resumes in.
    pub fn state(&self) -> CoordinatorState {
        match self.action {
            CoordinatorAction::DecideAbort => CoordinatorState::Init,
            CoordinatorAction::Reprepare => CoordinatorState::Preparing,
            CoordinatorAction::Disseminate(d) => CoordinatorState::deciding(d),
            CoordinatorAction::Finished(d) => CoordinatorState::finished(d),
        }
    }
}

/// What a recovering participant must do for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    /// Nothing; the transaction is terminal.
    None,
    /// Never voted; log an abort (its effects are already undone).
    AbortUnilaterally,
    /// Voted commit without learning the outcome.
    ResolveInDoubt,
}

/// Rebuilt participant view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecovery {
    /// The transaction.
    pub txn: TxnId,
    /// Its coordinator.
    pub coordinator: NodeId,
    /// Fellow participants, known once voted.
    pub participants: Vec<NodeId>,
    /// State after the plan is applied.
    pub state: ParticipantState,
    /// Writes in log order, needed to undo an in-doubt transaction later.
    pub writes: Vec<OperationPayload>,
    /// Operations executed, reads included.
    pub operations: u32,
    /// What to do next.
    pub action: ParticipantAction,
}

/// Everything recovery needs to rebuild a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Images to install, in order.
    pub resource_actions: Vec<ResourceAction>,
    /// Transactions this node coordinates.
    pub coordinator: Vec<CoordinatorRecovery>,
    /// Transactions this node participates in.
    pub participant: Vec<ParticipantRecovery>,
    /// Records replayed.
    pub records: usize,
}

impl RecoveryPlan {
    /// Installs the resource images into `store`, in order.
    pub fn apply_to(&self, store: &dyn ResourceManager) {
        for action in &self.resource_actions {
            store.restore(&action.resource, action.image);
        }
    }

    /// Highest sequence used by a transaction this node coordinated.
    pub fn max_sequence(&self) -> Option<u64> {
        self.coordinator.iter().map(|c| c.txn.sequence()).max()
    }

    /// Participant transactions waiting for an outcome.
    pub fn in_doubt(&self) -> impl Iterator<Item = &ParticipantRecovery> {
        self.participant
            .iter()
            .filter(|p| p.action == ParticipantAction::ResolveInDoubt)
    }
}

#[derive(Default)]
struct CoordinatorReplay {
    participants: Vec<NodeId>,
    operation_counts: Vec<u32>,
    prepared: bool,
    decision: Option<Decision>,
    ended: bool,
}

#[derive(Default)]
struct ParticipantReplay {
    participants: Vec<NodeId>,
    writes: Vec<OperationPayload>,
    operations: u32,
    vote: Option<Vote>,
    decision: Option<Decision>,
    undone: bool,
}

impl ParticipantReplay {
    fn undo(&mut self, txn: TxnId, actions: &mut Vec<ResourceAction>) {
        if self.undone {
            return;
        }
        self.undone = true;
        for write in self.writes.iter().rev() {
            actions.push(ResourceAction {
                txn,
                resource: write.resource.clone(),
                image: write.before,
                kind: ImageKind::Undo,
            });
        }
    }
}

/// Builds a recovery plan from a node's log, in LSN order.
pub fn plan_recovery(records: &[LogRecord]) -> RecoveryPlan {
    let mut coordinators: BTreeMap<TxnId, CoordinatorReplay> = BTreeMap::new();
    let mut participants: BTreeMap<TxnId, ParticipantReplay> = BTreeMap::new();
    let mut actions = Vec::new();

    for record in records {
        let txn = record.txn_id();
        match (record.role(), &record.payload) {
            (Some(Role::Coordinator), payload) => {
                let entry = coordinators.entry(txn).or_default();
                match payload {
                    LogPayload::Begin { participants } => {
                        entry.participants = participants.clone();
                    }
                    LogPayload::Prepare {
                        participants,
                        operation_counts,
                    } => {
                        entry.participants = participants.clone();
                        entry.operation_counts = operation_counts.clone();
                        entry.prepared = true;
                    }
                    LogPayload::Decision { decision } => entry.decision = Some(*decision),
                    LogPayload::End => entry.ended = true,
                    other => debug!(txn = %txn, kind = ?other.kind(), "ignoring coordinator record"),
                }
            }
            (Some(Role::Participant), payload) => {
                let entry = participants.entry(txn).or_default();
                match payload {
                    LogPayload::Operation(op) => {
                        entry.operations += 1;
                        if op.access == Access::Write {
                            actions.push(ResourceAction {
                                txn,
                                resource: op.resource.clone(),
                                image: op.after,
                                kind: ImageKind::Redo,
                            });
                            entry.writes.push(op.clone());
                        }
                    }
                    LogPayload::Vote {
                        vote, participants, ..
                    } => {
                        entry.vote = Some(*vote);
                        entry.participants = participants.clone();
                        if *vote == Vote::Abort {
                            entry.undo(txn, &mut actions);
                        }
                    }
                    LogPayload::Decision { decision } => {
                        entry.decision = Some(*decision);
                        if *decision == Decision::Abort {
                            entry.undo(txn, &mut actions);
                        }
                    }
                    other => debug!(txn = %txn, kind = ?other.kind(), "ignoring participant record"),
                }
            }
            (None, _) => debug!(txn = %txn, lsn = %record.lsn(), "record without role"),
        }
    }

    let coordinator = coordinators
        .into_iter()
        .map(|(txn, c)| {
            let action = match (c.decision, c.ended, c.prepared) {
                (Some(d), true, _) => CoordinatorAction::Finished(d),
                (None, true, _) => CoordinatorAction::Finished(Decision::Abort),
                (Some(d), false, _) => CoordinatorAction::Disseminate(d),
                (None, false, true) => CoordinatorAction::Reprepare,
                (None, false, false) => CoordinatorAction::DecideAbort,
            };
            CoordinatorRecovery {
                txn,
                participants: c.participants,
                operation_counts: c.operation_counts,
                decision: c.decision,
                action,
            }
        })
        .collect();

    let participant = participants
        .into_iter()
        .map(|(txn, mut p)| {
            let (state, action) = match (p.decision, p.vote) {
                (Some(Decision::Commit), _) => (ParticipantState::Committed, ParticipantAction::None),
                (Some(Decision::Abort), _) | (None, Some(Vote::Abort)) => {
                    (ParticipantState::Aborted, ParticipantAction::None)
                }
                (None, Some(Vote::Commit)) => {
                    (ParticipantState::Prepared, ParticipantAction::ResolveInDoubt)
                }
                (None, None) => {
                    p.undo(txn, &mut actions);
                    (ParticipantState::Aborted, ParticipantAction::AbortUnilaterally)
                }
            };
            ParticipantRecovery {
                txn,
                coordinator: txn.coordinator(),
                participants: p.participants,
                state,
                writes: p.writes,
                operations: p.operations,
                action,
            }
        })
        .collect();

    RecoveryPlan {
        resource_actions: actions,
        coordinator,
        participant,
        records: records.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::types::Lsn;
    use concord_txn::MemoryStore;

    struct LogBuilder {
        records: Vec<LogRecord>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self { records: Vec::new() }
        }

        fn push(&mut self, txn: TxnId, role: Role, payload: LogPayload) -> &mut Self {
            let lsn = Lsn::new(self.records.len() as u64 + 1);
            self.records.push(LogRecord::new(lsn, txn, role, payload).unwrap());
            self
        }

        fn write(&mut self, txn: TxnId, resource: &str, before: i64, after: i64) -> &mut Self {
            self.push(
                txn,
                Role::Participant,
                LogPayload::Operation(OperationPayload {
                    resource: resource.to_string(),
                    access: Access::Write,
                    before: Some(before),
                    after: Some(after),
                }),
            )
        }

        fn vote(&mut self, txn: TxnId, vote: Vote) -> &mut Self {
            self.push(
                txn,
                Role::Participant,
                LogPayload::Vote {
                    vote,
                    coordinator: txn.coordinator(),
                    participants: vec![NodeId::new(2), NodeId::new(3)],
                },
            )
        }

        fn decide(&mut self, txn: TxnId, role: Role, decision: Decision) -> &mut Self {
            self.push(txn, role, LogPayload::Decision { decision })
        }
    }

    fn txn(seq: u64) -> TxnId {
        TxnId::compose(NodeId::new(1), seq)
    }

    fn seeded() -> MemoryStore {
        let mut seed = BTreeMap::new();
        seed.insert("x".to_string(), 100);
        seed.insert("y".to_string(), 50);
        MemoryStore::with_accounts(seed)
    }

    #[test]
    fn test_empty_log() {
        let plan = plan_recovery(&[]);
        assert_eq!(plan, RecoveryPlan::default());
        assert_eq!(plan.max_sequence(), None);
    }

    #[test]
    fn test_committed_effects_are_redone() {
        let mut log = LogBuilder::new();
        log.write(txn(1), "x", 100, 70)
            .vote(txn(1), Vote::Commit)
            .decide(txn(1), Role::Participant, Decision::Commit);

        let plan = plan_recovery(&log.records);
        let store = seeded();
        plan.apply_to(&store);

        assert_eq!(store.read("x").unwrap(), 70);
        assert_eq!(plan.participant[0].state, ParticipantState::Committed);
        assert_eq!(plan.participant[0].action, ParticipantAction::None);
    }

    #[test]
    fn test_abort_is_undone_where_it_happened() {
        // T1 aborts, then T2 writes the same resource and commits. The undo
        // of T1 must not clobber T2's value.
        let mut log = LogBuilder::new();
        log.write(txn(1), "x", 100, 10)
            .decide(txn(1), Role::Participant, Decision::Abort)
            .write(txn(2), "x", 100, 120)
            .vote(txn(2), Vote::Commit)
            .decide(txn(2), Role::Participant, Decision::Commit);

        let plan = plan_recovery(&log.records);
        let store = seeded();
        plan.apply_to(&store);

        assert_eq!(store.read("x").unwrap(), 120);
    }

    #[test]
    fn test_vote_abort_then_abort_decision_undoes_once() {
        let mut log = LogBuilder::new();
        log.write(txn(1), "x", 100, 10)
            .vote(txn(1), Vote::Abort)
            .write(txn(2), "x", 100, 90)
            .decide(txn(1), Role::Participant, Decision::Abort);

        let plan = plan_recovery(&log.records);
        let undos = plan
            .resource_actions
            .iter()
            .filter(|a| a.kind == ImageKind::Undo && a.txn == txn(1))
            .count();
        assert_eq!(undos, 1);

        let store = seeded();
        plan.apply_to(&store);
        // T2 is still undecided and never voted, so it is undone too.
        assert_eq!(store.read("x").unwrap(), 100);
    }

    #[test]
    fn test_unvoted_transaction_aborts_unilaterally() {
        let mut log = LogBuilder::new();
        log.write(txn(4), "x", 100, 60).write(txn(4), "y", 50, 90);

        let plan = plan_recovery(&log.records);
        let p = &plan.participant[0];
        assert_eq!(p.action, ParticipantAction::AbortUnilaterally);
        assert_eq!(p.state, ParticipantState::Aborted);
        assert_eq!(p.operations, 2);

        let store = seeded();
        plan.apply_to(&store);
        assert_eq!(store.read("x").unwrap(), 100);
        assert_eq!(store.read("y").unwrap(), 50);
    }

    #[test]
    fn test_in_doubt_keeps_effects() {
        let mut log = LogBuilder::new();
        log.write(txn(5), "y", 50, 80).vote(txn(5), Vote::Commit);

        let plan = plan_recovery(&log.records);
        let in_doubt: Vec<_> = plan.in_doubt().collect();
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].state, ParticipantState::Prepared);
        assert_eq!(in_doubt[0].coordinator, NodeId::new(1));
        assert_eq!(in_doubt[0].participants, vec![NodeId::new(2), NodeId::new(3)]);
        assert_eq!(in_doubt[0].writes.len(), 1);

        let store = seeded();
        plan.apply_to(&store);
        assert_eq!(store.read("y").unwrap(), 80);
    }

    #[test]
    fn test_coordinator_actions() {
        let parts = vec![NodeId::new(2), NodeId::new(3)];
        let mut log = LogBuilder::new();
        log.push(txn(1), Role::Coordinator, LogPayload::Begin { participants: parts.clone() });
        log.push(txn(2), Role::Coordinator, LogPayload::Begin { participants: parts.clone() })
            .push(
                txn(2),
                Role::Coordinator,
                LogPayload::Prepare {
                    participants: parts.clone(),
                    operation_counts: vec![1, 1],
                },
            );
        log.push(txn(3), Role::Coordinator, LogPayload::Begin { participants: parts.clone() })
            .decide(txn(3), Role::Coordinator, Decision::Commit);
        log.push(txn(4), Role::Coordinator, LogPayload::Begin { participants: parts.clone() })
            .decide(txn(4), Role::Coordinator, Decision::Abort)
            .push(txn(4), Role::Coordinator, LogPayload::End);

        let plan = plan_recovery(&log.records);
        let actions: Vec<_> = plan.coordinator.iter().map(|c| c.action).collect();
        assert_eq!(
            actions,
            vec![
                CoordinatorAction::DecideAbort,
                CoordinatorAction::Reprepare,
                CoordinatorAction::Disseminate(Decision::Commit),
                CoordinatorAction::Finished(Decision::Abort),
            ]
        );
        assert_eq!(plan.coordinator[1].operation_counts, vec![1, 1]);
        assert_eq!(plan.coordinator[2].state(), CoordinatorState::Committing);
        assert_eq!(plan.max_sequence(), Some(4));
        assert!(plan.participant.is_empty());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut log = LogBuilder::new();
        log.write(txn(1), "x", 100, 70)
            .vote(txn(1), Vote::Commit)
            .write(txn(2), "y", 50, 0)
            .decide(txn(1), Role::Participant, Decision::Commit)
            .decide(txn(2), Role::Participant, Decision::Abort);

        let first = plan_recovery(&log.records);
        let second = plan_recovery(&log.records);
        assert_eq!(first, second);

        let store = seeded();
        first.apply_to(&store);
        let once = store.snapshot();
        second.apply_to(&store);
        assert_eq!(store.snapshot(), once);
    }
}
