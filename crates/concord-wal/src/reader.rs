//! WAL reader for recovery.
//!
//! This module provides the reader component for:
//! - Scanning the log file from the start
//! - Validating record checksums
//! - Finding where the last intact record ends

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::Buf;
use tracing::warn;

use concord_common::types::Lsn;

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::record::header::RecordHeader;
use crate::record::types::LogRecord;

/// Outcome of scanning a log file.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Intact records in LSN order.
    pub records: Vec<LogRecord>,
    /// Byte offset just past the last intact record.
    pub valid_len: u64,
    /// Bytes after `valid_len` that did not form an intact record.
    pub torn_bytes: u64,
}

impl ScanResult {
    /// Returns the highest LSN found, if any.
    pub fn max_lsn(&self) -> Option<Lsn> {
        self.records.last().map(LogRecord::lsn)
    }
}

/// WAL reader.
pub struct WalReader<'a> {
    config: &'a WalConfig,
}

impl<'a> WalReader<'a> {
    /// Creates a new WAL reader.
    pub fn new(config: &'a WalConfig) -> Self {
        Self { config }
    }

    /// Scans the whole log file.
    pub fn scan(&self) -> WalResult<ScanResult> {
        self.scan_prefix(None)
    }

    /// Scans at most `limit` bytes of the log file.
    ///
    /// A missing file is an empty log. Scanning stops at the first record
    /// that is incomplete, fails its checksum, or does not follow the
    /// previous LSN; everything from there on is reported as torn.
    pub fn scan_prefix(&self, limit: Option<u64>) -> WalResult<ScanResult> {
        let path = self.config.file_path();
        let data = match read_file(&path, limit)? {
            Some(data) => data,
            None => return Ok(ScanResult::default()),
        };

        let mut result = ScanResult::default();
        let mut offset = 0usize;
        let mut last_lsn = Lsn::INVALID;

        while offset < data.len() {
            match self.decode_at(&data[offset..], last_lsn) {
                Ok((record, size)) => {
                    last_lsn = record.lsn();
                    result.records.push(record);
                    offset += size;
                }
                Err(e) => {
                    warn!(
                        offset,
                        remaining = data.len() - offset,
                        error = %e,
                        "stopping WAL scan at damaged tail"
                    );
                    break;
                }
            }
        }

        result.valid_len = offset as u64;
        result.torn_bytes = (data.len() - offset) as u64;
        Ok(result)
    }

    fn decode_at(&self, buf: &[u8], last_lsn: Lsn) -> WalResult<(LogRecord, usize)> {
        let mut cursor = buf;
        let header = RecordHeader::deserialize(&mut cursor)?;

        let payload_len = header.payload_length as usize;
        if payload_len > self.config.max_record_size {
            return Err(WalError::record_too_large(
                payload_len,
                self.config.max_record_size,
            ));
        }
        if cursor.remaining() < payload_len {
            return Err(WalError::corrupted(header.lsn, "truncated payload"));
        }
        if header.lsn <= last_lsn {
            return Err(WalError::corrupted(
                header.lsn,
                format!("LSN does not follow {}", last_lsn),
            ));
        }

        let record = LogRecord::decode(
            header,
            &cursor[..payload_len],
            self.config.verify_checksums,
        )?;
        Ok((record, header.total_size()))
    }
}

fn read_file(path: &Path, limit: Option<u64>) -> WalResult<Option<Vec<u8>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut data = Vec::new();
    match limit {
        Some(limit) => {
            file.take(limit).read_to_end(&mut data)?;
        }
        None => {
            let mut file = file;
            file.read_to_end(&mut data)?;
        }
    }
    Ok(Some(data))
}
