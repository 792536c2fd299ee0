//! System-wide constants for Concord.
//!
//! Protocol limits, on-disk format constants and configuration defaults.

// =============================================================================
// Write-Ahead Log Constants
// =============================================================================

/// WAL record header size in bytes.
///
/// magic (2), kind (1), flags (1), payload_length (4), checksum (4),
/// lsn (8), txn_id (8) = 28 bytes.
pub const WAL_RECORD_HEADER_SIZE: usize = 28;

/// Tag at the start of every WAL record ("CR").
pub const WAL_RECORD_MAGIC: u16 = 0x4352;

/// Maximum size of a single WAL record payload (1 MB).
pub const MAX_WAL_RECORD_SIZE: usize = 1024 * 1024;

/// Name of the log file inside the WAL directory.
pub const WAL_FILE_NAME: &str = "concord.wal";

// =============================================================================
// Protocol Constants
// =============================================================================

/// Magic number at the start of every wire frame ("CNCD").
pub const FRAME_MAGIC: u32 = 0x434E_4344;

/// Maximum encoded message size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Timing Defaults (milliseconds)
// =============================================================================

/// Default bound on waiting for a participant's vote.
pub const DEFAULT_PREPARE_TIMEOUT_MS: u64 = 5000;

/// Default bound on a single COMMIT/ABORT delivery attempt.
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 3000;

/// Default bound on a single operation dispatch.
pub const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 3000;

/// Default bound on waiting for a lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3000;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// Default silence after which a peer is considered down.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5000;

/// Default first retry delay for decision dissemination.
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 50;

/// Default cap on the retry delay for decision dissemination.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 2000;

/// Default interval between outcome queries by an in-doubt participant.
pub const DEFAULT_OUTCOME_QUERY_INTERVAL_MS: u64 = 1000;

/// Default idle time after which an unvoted participant transaction checks
/// whether its coordinator still wants it.
pub const DEFAULT_ACTIVE_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default number of finished transactions remembered per role.
pub const DEFAULT_RETAINED_TRANSACTIONS: usize = 1024;
