//! Errors raised by the transaction log.

use std::io;
use thiserror::Error;

use concord_common::types::Lsn;

/// Result alias used throughout the log.
pub type WalResult<T> = Result<T, WalError>;

/// Failures of the transaction log.
#[derive(Debug, Error)]
pub enum WalError {
    /// The underlying file could not be read, written or synced.
    #[error("log file I/O failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// A damaged record followed by readable ones.
    #[error("log damaged at {lsn}: {reason}")]
    Corrupted { lsn: Lsn, reason: String },

    /// Stored and recomputed CRC32 differ.
    #[error("record {lsn} failed its checksum (stored {expected:#010x}, actual {computed:#010x})")]
    ChecksumMismatch {
        lsn: Lsn,
        expected: u32,
        computed: u32,
    },

    /// Encoded payload exceeds `max_record_size`.
    #[error("record payload of {size} bytes over the {max} byte limit")]
    RecordTooLarge { size: usize, max: usize },

    /// Append or sync after [`Wal::close`](crate::Wal::close).
    #[error("log already closed")]
    Closed,

    /// A failed append left bytes past `len` that could not be cut off.
    /// Nothing more may be appended until the log is reopened.
    #[error("log writer poisoned: bytes past offset {len} could not be removed")]
    Poisoned { len: u64 },

    #[error("cannot decode record payload: {reason}")]
    DeserializationError { reason: String },

    #[error("cannot encode record payload: {reason}")]
    SerializationError { reason: String },

    /// The log was opened with an unusable [`WalConfig`](crate::WalConfig).
    #[error("invalid log configuration: {reason}")]
    ConfigError { reason: String },
}

impl WalError {
    pub fn corrupted(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            lsn,
            reason: reason.into(),
        }
    }

    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    pub fn record_too_large(size: usize, max: usize) -> Self {
        Self::RecordTooLarge { size, max }
    }

    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::SerializationError {
            reason: reason.into(),
        }
    }

    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// True when the bytes on disk, not the environment, are at fault.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. } | Self::ChecksumMismatch { .. } | Self::DeserializationError { .. }
        )
    }
}
