//! Where the log lives and how hard it tries to be durable.

use std::path::PathBuf;

use concord_common::constants::{MAX_WAL_RECORD_SIZE, WAL_FILE_NAME};

use crate::error::{WalError, WalResult};

/// When appended records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// `fdatasync` inside every append.
    #[default]
    EveryWrite,
    /// Leave flushing to the OS. A crash may lose acknowledged records,
    /// so only tests use this.
    Never,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the log file. Created on open.
    pub dir: PathBuf,
    /// Upper bound on an encoded payload.
    pub max_record_size: usize,
    pub sync_policy: SyncPolicy,
    /// Recompute CRCs while scanning.
    pub verify_checksums: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            max_record_size: MAX_WAL_RECORD_SIZE,
            sync_policy: SyncPolicy::default(),
            verify_checksums: true,
        }
    }
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    #[must_use]
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// The header stores payload lengths as `u32`.
    pub fn validate(&self) -> WalResult<()> {
        match self.max_record_size {
            0 => Err(WalError::config_error("max_record_size is zero")),
            n if n > u32::MAX as usize => Err(WalError::config_error(format!(
                "max_record_size {} does not fit a record header",
                n
            ))),
            _ => Ok(()),
        }
    }

    /// `dir` joined with the log file name.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE_NAME)
    }
}
