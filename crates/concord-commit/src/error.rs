//! Error types for the commit protocol.

use thiserror::Error;

use concord_common::error::ErrorCode;
use concord_common::types::{NodeId, TxnId};
use concord_txn::{LockError, ResourceError};
use concord_wal::WalError;

use crate::transport::TransportError;

/// Errors raised by the coordinator, the participant and the node runtime.
#[derive(Debug, Error)]
pub enum TxnError {
    /// The participant set was rejected; no transaction was created.
    #[error("enlistment failed: {0}")]
    Enlistment(String),

    /// A lock could not be acquired in time.
    #[error("transaction {txn} timed out waiting for a lock on {resource}")]
    LockTimeout {
        /// The transaction.
        txn: TxnId,
        /// The contended resource.
        resource: String,
    },

    /// The deadlock policy refused a lock wait.
    #[error("transaction {txn} chosen as deadlock victim on {resource}")]
    Deadlock {
        /// The transaction.
        txn: TxnId,
        /// The contended resource.
        resource: String,
    },

    /// A local operation could not be applied.
    #[error("transaction {txn}: {source}")]
    Resource {
        /// The transaction.
        txn: TxnId,
        /// What went wrong.
        #[source]
        source: ResourceError,
    },

    /// A participant did not answer in time.
    #[error("participant {node} unreachable for transaction {txn}")]
    ParticipantUnreachable {
        /// The silent participant.
        node: NodeId,
        /// The transaction.
        txn: TxnId,
    },

    /// The coordinator could not be asked for an outcome.
    #[error("coordinator {coordinator} unreachable; transaction {txn} is blocked")]
    CoordinatorUnreachable {
        /// The transaction.
        txn: TxnId,
        /// Its coordinator.
        coordinator: NodeId,
    },

    /// The request does not fit the transaction's current state.
    #[error("transaction {txn} is {state}, expected {expected}")]
    InvalidState {
        /// The transaction.
        txn: TxnId,
        /// Its current state.
        state: String,
        /// The state the request needs.
        expected: &'static str,
    },

    /// The transaction is not known here.
    #[error("transaction {0} not found")]
    NotFound(TxnId),

    /// The node is crashed or shutting down.
    #[error("node {0} is unavailable")]
    NodeUnavailable(NodeId),

    /// Writing or reading the log failed.
    #[error("log error: {0}")]
    Wal(#[from] WalError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A peer answered with an error.
    #[error("remote error {code:?}: {message}")]
    Remote {
        /// The peer's error code.
        code: ErrorCode,
        /// The peer's message.
        message: String,
    },
}

/// Result type for commit protocol operations.
pub type TxnResult<T> = Result<T, TxnError>;

impl TxnError {
    /// Builds the error for a refused or expired lock request.
    pub fn from_lock(err: LockError) -> Self {
        match err {
            LockError::Timeout { txn, resource, .. } => Self::LockTimeout { txn, resource },
            LockError::Deadlock { txn, resource, .. } => Self::Deadlock { txn, resource },
            LockError::Shrinking { txn } => Self::InvalidState {
                txn,
                state: "shrinking".to_string(),
                expected: "growing",
            },
        }
    }

    /// Returns the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Enlistment(_) => ErrorCode::Enlistment,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::Resource { .. } => ErrorCode::ResourceFailure,
            Self::ParticipantUnreachable { .. } => ErrorCode::ParticipantUnreachable,
            Self::CoordinatorUnreachable { .. } => ErrorCode::CoordinatorUnreachable,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::NotFound(_) => ErrorCode::TransactionNotFound,
            Self::NodeUnavailable(_) => ErrorCode::NodeUnavailable,
            Self::Wal(_) => ErrorCode::LogFailure,
            Self::Transport(TransportError::Timeout) => ErrorCode::Timeout,
            Self::Transport(_) => ErrorCode::NodeUnavailable,
            Self::Remote { code, .. } => *code,
        }
    }

    /// Returns true if the error aborts only the affected transaction.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::Deadlock { .. }
                | Self::Resource { .. }
                | Self::ParticipantUnreachable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_lock_error() {
        let txn = TxnId::compose(NodeId::new(1), 3);
        let err = TxnError::from_lock(LockError::Timeout {
            txn,
            resource: "alice".into(),
            waited: Duration::from_millis(5),
        });
        assert_eq!(err.code(), ErrorCode::LockTimeout);
        assert!(err.aborts_transaction());
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn test_codes() {
        let txn = TxnId::compose(NodeId::new(2), 1);
        assert_eq!(
            TxnError::Enlistment("empty".into()).code(),
            ErrorCode::Enlistment
        );
        assert_eq!(
            TxnError::CoordinatorUnreachable {
                txn,
                coordinator: NodeId::new(2)
            }
            .code(),
            ErrorCode::CoordinatorUnreachable
        );
        assert_eq!(
            TxnError::Transport(TransportError::Timeout).code(),
            ErrorCode::Timeout
        );
    }
}
