//! # concord-wal
//!
//! Write-ahead logging for Concord.
//!
//! Every node keeps a single append-only log that records the phase
//! transitions of the transactions it coordinates and the ones it
//! participates in. The log is the only persisted artifact of a node:
//! after a crash, replaying it rebuilds every in-flight transaction.
//!
//! Guarantees:
//! - `append` returns only after the record is on disk (under the default
//!   [`SyncPolicy::EveryWrite`])
//! - records are never modified once written
//! - a record torn by a crash in the middle of a write is detected by its
//!   checksum and cut off when the log is reopened
//!
//! ## Record Format
//!
//! Each record is a 28-byte header followed by a bincode payload:
//!
//! ```text
//! +-------+------+-------+--------+-------+-----+-------+---------------+
//! | magic | kind | flags | length | crc32 | lsn | txnid | payload ...   |
//! +-------+------+-------+--------+-------+-----+-------+---------------+
//! ```
//!
//! The flags carry the role (coordinator or participant) that wrote the
//! record, so a node that plays both roles shares one log.

#![warn(clippy::all)]

mod config;
mod error;

/// Log record types and serialization.
pub mod record;

/// Appending records.
pub mod writer;

/// Scanning records back.
pub mod reader;

/// Main WAL handle.
pub mod wal;

pub use config::{SyncPolicy, WalConfig};
pub use error::{WalError, WalResult};
pub use record::{
    LogPayload, LogRecord, OperationPayload, RecordFlags, RecordHeader, RecordKind, Role,
};
pub use wal::{Wal, WalStats};
