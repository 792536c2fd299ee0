//! Inter-node protocol messages.
//!
//! Every exchange is a request answered by exactly one response:
//!
//! ```text
//! EXECUTE        → EXECUTED | ERROR
//! PREPARE        → VOTE_COMMIT | VOTE_ABORT
//! COMMIT / ABORT → ACK
//! QUERY_OUTCOME  → COMMIT | ABORT | UNKNOWN   (asked of the coordinator)
//! PEER_OUTCOME   → COMMIT | ABORT | UNKNOWN   (asked of a fellow participant)
//! PING           → PONG
//! SUBMIT / STATUS / NODE_STATUS                (client-facing)
//! ```
//!
//! Messages are serialized with bincode inside the frames described in
//! [`frame`].

pub mod frame;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_common::error::ErrorCode;
use concord_common::types::{Decision, NodeId, TxnId, Vote};
use concord_txn::Operation;

use crate::error::TxnError;
use crate::failure::PeerHealth;
use crate::state::{CoordinatorState, ParticipantState};

/// One operation and the participant that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnOperation {
    /// Participant holding the resource.
    pub node: NodeId,
    /// The operation.
    pub op: Operation,
}

impl TxnOperation {
    /// Creates a new operation for `node`.
    pub fn new(node: NodeId, op: Operation) -> Self {
        Self { node, op }
    }
}

/// A client's request to run a distributed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Nodes enlisted as participants.
    pub participants: Vec<NodeId>,
    /// Operations, executed in order.
    pub operations: Vec<TxnOperation>,
}

impl TransactionRequest {
    /// Creates a request enlisting `participants` with no operations yet.
    pub fn new(participants: Vec<NodeId>) -> Self {
        Self {
            participants,
            operations: Vec::new(),
        }
    }

    /// Appends an operation, enlisting its node if needed.
    pub fn with_operation(mut self, node: NodeId, op: Operation) -> Self {
        if !self.participants.contains(&node) {
            self.participants.push(node);
        }
        self.operations.push(TxnOperation::new(node, op));
        self
    }

    /// Builds a transfer of `amount` between two accounts.
    ///
    /// The debit runs first, then the credit. The transaction only votes
    /// commit if the source balance stays non-negative.
    pub fn transfer(
        from_node: NodeId,
        from_account: impl Into<String>,
        to_node: NodeId,
        to_account: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self::default()
            .with_operation(from_node, Operation::add(from_account, -amount))
            .with_operation(to_node, Operation::add(to_account, amount))
    }

    /// Returns how many operations each participant receives, parallel to
    /// `participants`.
    pub fn operation_counts(&self) -> Vec<u32> {
        self.participants
            .iter()
            .map(|p| self.operations.iter().filter(|o| o.node == *p).count() as u32)
            .collect()
    }

    /// Checks the request's shape.
    pub fn validate(&self) -> Result<(), TxnError> {
        if self.participants.is_empty() {
            return Err(TxnError::Enlistment("no participants".to_string()));
        }
        for (i, p) in self.participants.iter().enumerate() {
            if !p.is_valid() {
                return Err(TxnError::Enlistment("invalid participant id 0".to_string()));
            }
            if self.participants[..i].contains(p) {
                return Err(TxnError::Enlistment(format!("participant {} listed twice", p)));
            }
        }
        if let Some(op) = self
            .operations
            .iter()
            .find(|o| !self.participants.contains(&o.node))
        {
            return Err(TxnError::Enlistment(format!(
                "operation '{}' targets node {} which is not enlisted",
                op.op, op.node
            )));
        }
        Ok(())
    }
}

/// What a node knows about a transaction's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Commit was decided.
    Commit,
    /// Abort was decided.
    Abort,
    /// No decision yet.
    Unknown,
}

impl Outcome {
    /// Returns the decision, if one is known.
    pub fn decision(&self) -> Option<Decision> {
        match self {
            Self::Commit => Some(Decision::Commit),
            Self::Abort => Some(Decision::Abort),
            Self::Unknown => None,
        }
    }
}

impl From<Option<Decision>> for Outcome {
    fn from(decision: Option<Decision>) -> Self {
        match decision {
            Some(Decision::Commit) => Self::Commit,
            Some(Decision::Abort) => Self::Abort,
            None => Self::Unknown,
        }
    }
}

/// Whether submission waits for the transaction to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubmitMode {
    /// Return the transaction id as soon as it is enlisted.
    #[default]
    Async,
    /// Return once the transaction reached a terminal state.
    Sync,
}

/// Simulated liveness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    /// Serving requests normally.
    Up,
    /// Not answering anything until restarted.
    Crashed,
    /// Holding every request for the given time before serving it.
    Delayed(Duration),
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Crashed => write!(f, "crashed"),
            Self::Delayed(d) => write!(f, "delayed({}ms)", d.as_millis()),
        }
    }
}

/// A participant's vote as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// The participant.
    pub node: NodeId,
    /// Its vote; `None` while pending. A timeout is recorded as an abort.
    pub vote: Option<Vote>,
    /// Whether it acknowledged the decision.
    pub acked: bool,
}

/// Status of one transaction, as known by the answering node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatusReport {
    /// The transaction.
    pub txn: TxnId,
    /// Global state, when the answering node is the coordinator.
    pub coordinator_state: Option<CoordinatorState>,
    /// Local state, when the answering node is a participant.
    pub participant_state: Option<ParticipantState>,
    /// The decision, once known.
    pub decision: Option<Decision>,
    /// Enlisted participants.
    pub participants: Vec<NodeId>,
    /// Votes and acknowledgments, coordinator side.
    pub votes: Vec<VoteRecord>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Prepared participant that could not reach anyone who knows the outcome.
    pub blocked: bool,
}

impl TxnStatusReport {
    /// Creates an empty report for `txn`.
    pub fn new(txn: TxnId) -> Self {
        Self {
            txn,
            coordinator_state: None,
            participant_state: None,
            decision: None,
            participants: Vec::new(),
            votes: Vec::new(),
            created_at_ms: 0,
            blocked: false,
        }
    }

    /// Returns true once the answering node's view is final.
    pub fn is_terminal(&self) -> bool {
        match (self.coordinator_state, self.participant_state) {
            (Some(c), _) => c.is_terminal(),
            (None, Some(p)) => p.is_terminal(),
            (None, None) => false,
        }
    }
}

/// Liveness and load of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusReport {
    /// The node.
    pub node: NodeId,
    /// Its simulated liveness.
    pub liveness: Liveness,
    /// Transactions not yet terminal in either role.
    pub open_transactions: usize,
    /// Non-terminal transactions this node coordinates.
    pub coordinating: usize,
    /// Non-terminal transactions this node participates in.
    pub participating: usize,
    /// Prepared transactions waiting for an outcome.
    pub in_doubt: usize,
    /// Locks currently held.
    pub locks_held: usize,
    /// Health of each peer, as seen from this node.
    pub peers: Vec<(NodeId, PeerHealth)>,
}

/// Kinds of requests, used to target message-loss rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// [`Request::Execute`]
    Execute,
    /// [`Request::Prepare`]
    Prepare,
    /// [`Request::Commit`]
    Commit,
    /// [`Request::Abort`]
    Abort,
    /// [`Request::QueryOutcome`]
    QueryOutcome,
    /// [`Request::PeerOutcome`]
    PeerOutcome,
    /// [`Request::Ping`]
    Ping,
    /// [`Request::Submit`]
    Submit,
    /// [`Request::Status`]
    Status,
    /// [`Request::NodeStatus`]
    NodeStatus,
}

/// A request sent to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Run one operation of `txn` on the receiving participant.
    Execute {
        /// The transaction; its coordinator is encoded in the id.
        txn: TxnId,
        /// The operation.
        op: Operation,
    },
    /// Ask for a vote.
    Prepare {
        /// The transaction.
        txn: TxnId,
        /// Every participant, for cooperative termination.
        participants: Vec<NodeId>,
        /// Operations the coordinator sent to the receiver.
        operations: u32,
    },
    /// Commit was decided.
    Commit {
        /// The transaction.
        txn: TxnId,
    },
    /// Abort was decided.
    Abort {
        /// The transaction.
        txn: TxnId,
    },
    /// Ask the coordinator for its decision.
    QueryOutcome {
        /// The transaction.
        txn: TxnId,
    },
    /// Ask a fellow participant what it knows.
    PeerOutcome {
        /// The transaction.
        txn: TxnId,
    },
    /// Heartbeat.
    Ping,
    /// Run a new transaction coordinated by the receiver.
    Submit {
        /// What to run.
        request: TransactionRequest,
        /// Whether to answer only once the transaction is terminal.
        mode: SubmitMode,
    },
    /// Report a transaction's status.
    Status {
        /// The transaction.
        txn: TxnId,
    },
    /// Report the receiver's status.
    NodeStatus,
}

impl Request {
    /// Returns the kind of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Execute { .. } => RequestKind::Execute,
            Self::Prepare { .. } => RequestKind::Prepare,
            Self::Commit { .. } => RequestKind::Commit,
            Self::Abort { .. } => RequestKind::Abort,
            Self::QueryOutcome { .. } => RequestKind::QueryOutcome,
            Self::PeerOutcome { .. } => RequestKind::PeerOutcome,
            Self::Ping => RequestKind::Ping,
            Self::Submit { .. } => RequestKind::Submit,
            Self::Status { .. } => RequestKind::Status,
            Self::NodeStatus => RequestKind::NodeStatus,
        }
    }

    /// Returns the transaction the request refers to, if any.
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            Self::Execute { txn, .. }
            | Self::Prepare { txn, .. }
            | Self::Commit { txn }
            | Self::Abort { txn }
            | Self::QueryOutcome { txn }
            | Self::PeerOutcome { txn }
            | Self::Status { txn } => Some(*txn),
            Self::Ping | Self::Submit { .. } | Self::NodeStatus => None,
        }
    }

    /// Builds the decision message for `txn`.
    pub fn decision(txn: TxnId, decision: Decision) -> Self {
        match decision {
            Decision::Commit => Self::Commit { txn },
            Decision::Abort => Self::Abort { txn },
        }
    }
}

/// A node's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The operation was applied; carries the observed value.
    Executed {
        /// Value read or written.
        value: Option<i64>,
    },
    /// A vote.
    Vote {
        /// The vote.
        vote: Vote,
    },
    /// Decision applied.
    Ack,
    /// Answer to an outcome query.
    Outcome {
        /// What the responder knows.
        outcome: Outcome,
    },
    /// Heartbeat answer.
    Pong {
        /// Responder.
        node: NodeId,
    },
    /// A transaction was enlisted.
    Submitted {
        /// Its id.
        txn: TxnId,
    },
    /// A transaction's status.
    TxnStatus(TxnStatusReport),
    /// A node's status.
    NodeStatus(NodeStatusReport),
    /// The request failed.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Human readable description.
        message: String,
    },
}

impl Response {
    /// Builds an error response.
    pub fn error(err: &TxnError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Turns an error response back into a [`TxnError`].
    pub fn into_result(self) -> Result<Self, TxnError> {
        match self {
            Self::Error { code, message } => Err(TxnError::Remote { code, message }),
            other => Ok(other),
        }
    }
}
