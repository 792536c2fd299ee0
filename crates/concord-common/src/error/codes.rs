//! Stable error codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for categorizing errors.
///
/// These codes travel inside protocol error responses and are stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Operation timed out.
    Timeout = 0x0004,

    // Log errors (0x0100 - 0x01FF)
    /// Log write or read failed.
    LogFailure = 0x0100,

    // Local transaction errors (0x0300 - 0x03FF)
    /// Lock wait expired.
    LockTimeout = 0x0300,
    /// Deadlock detected.
    Deadlock = 0x0301,
    /// Local operation could not be applied.
    ResourceFailure = 0x0302,
    /// Transaction not found.
    TransactionNotFound = 0x0303,
    /// Transaction is not in a state that permits the request.
    InvalidState = 0x0304,
    /// Transaction was aborted.
    TransactionAborted = 0x0305,

    // Distributed errors (0x0500 - 0x05FF)
    /// Participant set rejected at enlistment.
    Enlistment = 0x0500,
    /// A participant did not answer.
    ParticipantUnreachable = 0x0501,
    /// The coordinator did not answer.
    CoordinatorUnreachable = 0x0502,
    /// Node is not accepting requests.
    NodeUnavailable = 0x0503,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match self.as_u16() >> 8 {
            0x00 => "general",
            0x01 => "log",
            0x03 => "transaction",
            0x05 => "cluster",
            _ => "unknown",
        }
    }

    /// Returns true if the caller may retry the request unchanged.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ParticipantUnreachable
                | Self::CoordinatorUnreachable
                | Self::NodeUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#06x})", self, self.as_u16())
    }
}
