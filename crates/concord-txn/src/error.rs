//! Error types for locking and local resource application.

use std::time::Duration;

use thiserror::Error;

use concord_common::error::ErrorCode;
use concord_common::types::TxnId;

/// Errors returned by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock was not granted within the bounded wait.
    #[error("transaction {txn} timed out after {waited:?} waiting for {resource}")]
    Timeout {
        /// The waiting transaction.
        txn: TxnId,
        /// The resource it waited for.
        resource: String,
        /// How long it waited.
        waited: Duration,
    },

    /// Waiting would close a cycle in the wait-for graph.
    #[error("transaction {txn} would deadlock waiting for {resource} (cycle {cycle:?})")]
    Deadlock {
        /// The requester, chosen as victim.
        txn: TxnId,
        /// The resource it asked for.
        resource: String,
        /// Transactions forming the cycle.
        cycle: Vec<TxnId>,
    },

    /// The transaction already released its locks and may not take more.
    #[error("transaction {txn} is in its shrinking phase")]
    Shrinking {
        /// The offending transaction.
        txn: TxnId,
    },
}

impl LockError {
    /// Returns the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            LockError::Timeout { .. } => ErrorCode::LockTimeout,
            LockError::Deadlock { .. } => ErrorCode::Deadlock,
            LockError::Shrinking { .. } => ErrorCode::InvalidState,
        }
    }
}

/// Errors raised while applying an operation to local resource state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The resource does not exist.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// A local constraint would be violated.
    #[error("constraint violated on {resource}: {reason}")]
    ConstraintViolation {
        /// The resource.
        resource: String,
        /// What is wrong.
        reason: String,
    },

    /// Arithmetic overflow while applying the operation.
    #[error("overflow applying operation to {0}")]
    Overflow(String),
}

impl ResourceError {
    /// Returns the wire error code.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ResourceFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_display() {
        let err = LockError::Timeout {
            txn: TxnId::new(5),
            resource: "alice".into(),
            waited: Duration::from_millis(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert_eq!(err.code(), ErrorCode::LockTimeout);
    }

    #[test]
    fn test_resource_error_code() {
        let err = ResourceError::UnknownResource("bob".into());
        assert_eq!(err.code(), ErrorCode::ResourceFailure);
        assert_eq!(err.to_string(), "unknown resource: bob");
    }
}
