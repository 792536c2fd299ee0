//! # concord-commit
//!
//! Distributed atomic commitment for Concord.
//!
//! This crate provides:
//!
//! - **Coordinator**: owns the global state of a transaction and drives
//!   two-phase commit across its participants. Any abort vote or missing
//!   vote aborts; the decision is logged before it is announced and then
//!   retried until every participant acknowledged it.
//!
//! - **Participant**: executes operations under strict two-phase locking,
//!   votes, applies the decision and resolves in-doubt transactions by
//!   asking the coordinator and, optionally, its peers.
//!
//! - **Recovery**: a pure planner that turns a node's log into the state
//!   to rebuild and the work to resume.
//!
//! - **Node**: the runtime tying one coordinator and one participant to a
//!   log, with liveness simulation for fault injection.
//!
//! - **Transport**: request/response messaging over an in-memory network
//!   for tests or length-prefixed frames over TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────── Node ─────────────────────────┐
//! │  ┌─────────────┐   PREPARE / COMMIT   ┌─────────────┐  │
//! │  │ Coordinator │ ───────────────────► │ Participant │  │
//! │  └─────────────┘ ◄─────────────────── └─────────────┘  │
//! │         │          VOTE / ACK              │    │      │
//! │         ▼                                  ▼    ▼      │
//! │  ┌──────────────────────────┐   ┌──────┐ ┌─────────┐   │
//! │  │           Wal            │   │ Lock │ │ Account │   │
//! │  └──────────────────────────┘   │ Mgr  │ │ Store   │   │
//! │                                 └──────┘ └─────────┘   │
//! └────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::time::{SystemTime, UNIX_EPOCH};

mod error;
mod history;

/// Coordinator and participant state machines.
pub mod state;

/// Protocol messages and wire framing.
pub mod protocol;

/// Message transports.
pub mod transport;

/// Heartbeat failure detection.
pub mod failure;

/// Log replay and recovery planning.
pub mod recovery;

/// Participant side of two-phase commit.
pub mod participant;

/// Coordinator side of two-phase commit.
pub mod coordinator;

/// Node runtime and fault injection.
pub mod node;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{TxnError, TxnResult};
pub use failure::{FailureDetector, PeerHealth};
pub use node::Node;
pub use participant::{Participant, ParticipantConfig};
pub use protocol::{
    Liveness, NodeStatusReport, Outcome, Request, RequestKind, Response, SubmitMode,
    TransactionRequest, TxnOperation, TxnStatusReport, VoteRecord,
};
pub use recovery::{plan_recovery, RecoveryPlan};
pub use state::{CoordinatorState, ParticipantState};
pub use transport::{
    DropRule, MemoryNetwork, MemoryTransport, RequestHandler, TcpServer, TcpTransport, Transport,
    TransportError, TransportResult,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
