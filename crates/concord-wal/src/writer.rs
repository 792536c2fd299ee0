//! WAL writer for appending records.
//!
//! The writer owns the tail of the log. LSN assignment, the write and the
//! optional fsync all happen under one mutex, so records land in the file
//! in LSN order and a reader bounded by [`WalWriter::durable_len`] never
//! sees a half-written record.
//!
//! A failed append is rolled back by truncating the file to the last
//! completed record, so the LSN it was given can be reused. If even that
//! fails the writer is poisoned and refuses further appends.

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::error;

use concord_common::types::{Lsn, TxnId};

use crate::error::{WalError, WalResult};
use crate::record::payload::LogPayload;
use crate::record::types::{LogRecord, Role};

/// The file operations the writer needs.
///
/// Implemented for [`File`]; the file must be opened for appending.
pub trait LogFile: Send {
    /// Writes the whole buffer at the end of the file.
    fn append_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Forces written data to disk.
    fn sync_data(&mut self) -> io::Result<()>;

    /// Cuts the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn append_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// WAL writer statistics.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Total bytes written.
    pub bytes_written: AtomicU64,
    /// Total records written.
    pub records_written: AtomicU64,
    /// Number of syncs performed.
    pub syncs: AtomicU64,
    /// Appends that failed and were rolled back.
    pub failed_appends: AtomicU64,
}

struct Tail<F> {
    file: F,
    next_lsn: Lsn,
    len: u64,
    poisoned: bool,
}

/// WAL writer for appending records.
pub struct WalWriter<F: LogFile = File> {
    tail: Mutex<Tail<F>>,
    max_record_size: usize,
    stats: WriterStats,
}

impl<F: LogFile> WalWriter<F> {
    /// Creates a writer over a file positioned at its end.
    pub fn new(file: F, len: u64, next_lsn: Lsn, max_record_size: usize) -> Self {
        Self {
            tail: Mutex::new(Tail {
                file,
                next_lsn,
                len,
                poisoned: false,
            }),
            max_record_size,
            stats: WriterStats::default(),
        }
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.tail.lock().next_lsn
    }

    /// Returns the length of the log covered by completed appends.
    pub fn durable_len(&self) -> u64 {
        self.tail.lock().len
    }

    /// Appends a record, returning its LSN.
    ///
    /// When `sync` is set the record is on disk before this returns. On
    /// error nothing of the record remains in the file and its LSN is
    /// assigned to the next append.
    pub fn append(
        &self,
        txn_id: TxnId,
        role: Role,
        payload: LogPayload,
        sync: bool,
    ) -> WalResult<LogRecord> {
        let mut tail = self.tail.lock();
        if tail.poisoned {
            return Err(WalError::Poisoned { len: tail.len });
        }

        let record = LogRecord::new(tail.next_lsn, txn_id, role, payload)?;
        let payload_len = record.header.payload_length as usize;
        if payload_len > self.max_record_size {
            return Err(WalError::record_too_large(payload_len, self.max_record_size));
        }

        let bytes = record.encode()?;
        let mut written = tail.file.append_all(&bytes);
        if written.is_ok() && sync {
            written = tail.file.sync_data();
            if written.is_ok() {
                self.stats.syncs.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Err(e) = written {
            self.stats.failed_appends.fetch_add(1, Ordering::Relaxed);
            let len = tail.len;
            if let Err(rollback) = tail.file.truncate(len) {
                error!(
                    lsn = %record.lsn(),
                    len,
                    error = %rollback,
                    "could not roll back failed append, poisoning writer"
                );
                tail.poisoned = true;
            }
            return Err(e.into());
        }

        tail.len += bytes.len() as u64;
        tail.next_lsn = tail.next_lsn.next();

        self.stats
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.stats.records_written.fetch_add(1, Ordering::Relaxed);

        Ok(record)
    }

    /// Forces everything written so far to disk.
    pub fn sync(&self) -> WalResult<()> {
        let mut tail = self.tail.lock();
        if tail.poisoned {
            return Err(WalError::Poisoned { len: tail.len });
        }
        tail.file.sync_data()?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns writer statistics.
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

impl<F: LogFile> std::fmt::Debug for WalWriter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tail = self.tail.lock();
        f.debug_struct("WalWriter")
            .field("next_lsn", &tail.next_lsn)
            .field("len", &tail.len)
            .field("poisoned", &tail.poisoned)
            .finish()
    }
}
