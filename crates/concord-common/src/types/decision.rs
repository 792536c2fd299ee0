//! Votes and the global outcome of a distributed transaction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commit or abort, as decided by a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Every participant applies the transaction's effects.
    Commit,
    /// No participant keeps any of the transaction's effects.
    Abort,
}

impl Decision {
    /// Returns true for [`Decision::Commit`].
    #[inline]
    #[must_use]
    pub const fn is_commit(self) -> bool {
        matches!(self, Decision::Commit)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Abort => write!(f, "abort"),
        }
    }
}

/// A participant's answer to PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// The participant can make the transaction's effects durable.
    Commit,
    /// The participant refuses; the transaction must abort everywhere.
    Abort,
}

impl Vote {
    /// Returns true for [`Vote::Commit`].
    #[inline]
    #[must_use]
    pub const fn is_commit(self) -> bool {
        matches!(self, Vote::Commit)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Commit => write!(f, "VOTE_COMMIT"),
            Vote::Abort => write!(f, "VOTE_ABORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Decision::Commit.to_string(), "commit");
        assert_eq!(Vote::Abort.to_string(), "VOTE_ABORT");
        assert!(Vote::Commit.is_commit());
        assert!(!Decision::Abort.is_commit());
    }
}
