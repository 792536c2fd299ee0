//! Access modes of transaction operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an operation reads or writes its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Read-only access, taken under a shared lock.
    Read,
    /// Mutating access, taken under an exclusive lock.
    Write,
}

impl Access {
    /// Returns true for [`Access::Write`].
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Access::Write)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}
