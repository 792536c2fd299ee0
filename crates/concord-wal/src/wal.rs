//! Main WAL manager.
//!
//! This module provides the `Wal` handle that every protocol component
//! logs through, and the replay entry points used by recovery.

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use concord_common::types::{Lsn, TxnId};

use crate::config::{SyncPolicy, WalConfig};
use crate::error::{WalError, WalResult};
use crate::reader::WalReader;
use crate::record::payload::LogPayload;
use crate::record::types::{LogRecord, Role};
use crate::writer::WalWriter;

/// WAL statistics.
#[derive(Debug, Default)]
pub struct WalStats {
    /// Records found when the log was opened.
    pub records_recovered: AtomicU64,
    /// Bytes cut off the tail when the log was opened.
    pub bytes_truncated: AtomicU64,
}

/// The Write-Ahead Log of one node.
pub struct Wal {
    /// Configuration.
    config: WalConfig,
    /// Owner of the log tail.
    writer: WalWriter,
    /// WAL statistics.
    stats: WalStats,
    /// Whether the WAL is closed.
    closed: AtomicBool,
}

impl Wal {
    /// Opens the log in `config.dir`, creating it if needed.
    ///
    /// Existing records are scanned and verified. A damaged tail, left by
    /// a crash in the middle of an append, is truncated so that new
    /// records follow the last intact one.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let scan = WalReader::new(&config).scan()?;
        let next_lsn = scan.max_lsn().map(Lsn::next).unwrap_or(Lsn::FIRST);

        let path = config.file_path();
        if scan.torn_bytes > 0 {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
            warn!(
                path = %path.display(),
                bytes = scan.torn_bytes,
                "truncated damaged WAL tail"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = WalWriter::new(file, scan.valid_len, next_lsn, config.max_record_size);

        let stats = WalStats::default();
        stats
            .records_recovered
            .store(scan.records.len() as u64, Ordering::Relaxed);
        stats
            .bytes_truncated
            .store(scan.torn_bytes, Ordering::Relaxed);

        info!(
            path = %path.display(),
            records = scan.records.len(),
            next_lsn = %next_lsn,
            "opened WAL"
        );

        Ok(Self {
            config,
            writer,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.writer.next_lsn()
    }

    /// Appends a record and returns its LSN.
    ///
    /// Under [`SyncPolicy::EveryWrite`] the record is durable when this
    /// returns; callers rely on that before acting on what they logged.
    pub fn append(&self, txn_id: TxnId, role: Role, payload: LogPayload) -> WalResult<Lsn> {
        self.check_closed()?;

        let sync = matches!(self.config.sync_policy, SyncPolicy::EveryWrite);
        let record = self.writer.append(txn_id, role, payload, sync)?;

        debug!(
            txn = %txn_id,
            lsn = %record.lsn(),
            kind = ?record.kind(),
            role = ?role,
            "appended WAL record"
        );

        Ok(record.lsn())
    }

    /// Syncs the WAL to disk.
    pub fn sync(&self) -> WalResult<()> {
        self.check_closed()?;
        self.writer.sync()
    }

    /// Returns every record in LSN order.
    pub fn records(&self) -> WalResult<Vec<LogRecord>> {
        let len = self.writer.durable_len();
        let scan = WalReader::new(&self.config).scan_prefix(Some(len))?;
        if scan.torn_bytes > 0 {
            return Err(WalError::corrupted(
                scan.max_lsn().unwrap_or(Lsn::INVALID).next(),
                "record appended by this process failed to read back",
            ));
        }
        Ok(scan.records)
    }

    /// Returns the records of one transaction in LSN order.
    pub fn records_for(&self, txn_id: TxnId) -> WalResult<Vec<LogRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.txn_id() == txn_id)
            .collect())
    }

    /// Returns the highest-numbered record of a transaction written in
    /// the given role.
    pub fn last_record(&self, txn_id: TxnId, role: Role) -> WalResult<Option<LogRecord>> {
        Ok(self
            .records_for(txn_id)?
            .into_iter()
            .filter(|r| r.role() == Some(role))
            .last())
    }

    /// Returns WAL statistics.
    pub fn stats(&self) -> &WalStats {
        &self.stats
    }

    /// Returns writer statistics.
    pub fn writer_stats(&self) -> &crate::writer::WriterStats {
        self.writer.stats()
    }

    /// Closes the WAL. Further appends fail with [`WalError::Closed`].
    pub fn close(&self) -> WalResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.writer.sync()?;
        }
        Ok(())
    }

    /// Returns true if the WAL is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Checks if the WAL is closed and returns an error if so.
    fn check_closed(&self) -> WalResult<()> {
        if self.is_closed() {
            Err(WalError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("config", &self.config)
            .field("next_lsn", &self.next_lsn())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OperationPayload, RecordKind};
    use concord_common::types::{Access, Decision, NodeId, Vote};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> WalConfig {
        WalConfig::new(dir).with_sync_policy(SyncPolicy::EveryWrite)
    }

    fn txn(seq: u64) -> TxnId {
        TxnId::compose(NodeId::new(1), seq)
    }

    #[test]
    fn test_wal_creation() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();
        assert!(!wal.is_closed());
        assert_eq!(wal.next_lsn(), Lsn::FIRST);
        assert!(wal.records().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();
        let participants = vec![NodeId::new(2), NodeId::new(3)];

        let l1 = wal
            .append(
                txn(1),
                Role::Coordinator,
                LogPayload::Begin {
                    participants: participants.clone(),
                },
            )
            .unwrap();
        let l2 = wal
            .append(
                txn(2),
                Role::Participant,
                LogPayload::Operation(OperationPayload {
                    resource: "alice".into(),
                    access: Access::Write,
                    before: Some(10),
                    after: Some(5),
                }),
            )
            .unwrap();
        let l3 = wal
            .append(
                txn(1),
                Role::Coordinator,
                LogPayload::Decision {
                    decision: Decision::Commit,
                },
            )
            .unwrap();

        assert!(l1 < l2 && l2 < l3);
        assert_eq!(wal.writer_stats().records_written.load(Ordering::Relaxed), 3);

        let all = wal.records().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].kind(), RecordKind::Operation);

        let mine = wal.records_for(txn(1)).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].payload, LogPayload::Begin { participants });

        let last = wal.last_record(txn(1), Role::Coordinator).unwrap().unwrap();
        assert_eq!(last.lsn(), l3);
        assert!(wal.last_record(txn(1), Role::Participant).unwrap().is_none());
    }

    #[test]
    fn test_wal_reopen_resumes_lsn() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let wal = Wal::open(config.clone()).unwrap();
            wal.append(
                txn(1),
                Role::Participant,
                LogPayload::Vote {
                    vote: Vote::Commit,
                    coordinator: NodeId::new(1),
                    participants: vec![NodeId::new(2)],
                },
            )
            .unwrap();
            wal.append(txn(1), Role::Participant, LogPayload::End).unwrap();
            wal.close().unwrap();
        }

        let wal = Wal::open(config).unwrap();
        assert_eq!(wal.next_lsn(), Lsn::new(3));
        assert_eq!(wal.stats().records_recovered.load(Ordering::Relaxed), 2);

        let lsn = wal.append(txn(2), Role::Participant, LogPayload::End).unwrap();
        assert_eq!(lsn, Lsn::new(3));
        assert_eq!(wal.records().unwrap().len(), 3);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let wal = Wal::open(config.clone()).unwrap();
            wal.append(
                txn(1),
                Role::Coordinator,
                LogPayload::Decision {
                    decision: Decision::Abort,
                },
            )
            .unwrap();
        }

        // Half a header left behind by a crash mid-append.
        let mut file = OpenOptions::new()
            .append(true)
            .open(config.file_path())
            .unwrap();
        file.write_all(&[0u8, 0, 0, 0, 0, 0, 0, 2, 1, 2, 3]).unwrap();
        drop(file);

        let wal = Wal::open(config.clone()).unwrap();
        assert_eq!(wal.stats().bytes_truncated.load(Ordering::Relaxed), 11);
        assert_eq!(wal.next_lsn(), Lsn::new(2));

        wal.append(txn(1), Role::Coordinator, LogPayload::End).unwrap();
        drop(wal);

        let wal = Wal::open(config).unwrap();
        let records = wal.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, LogPayload::End);
        assert_eq!(wal.stats().bytes_truncated.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wal_close() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();

        wal.append(txn(1), Role::Participant, LogPayload::End).unwrap();
        wal.close().unwrap();
        assert!(wal.is_closed());

        assert!(matches!(
            wal.append(txn(1), Role::Participant, LogPayload::End),
            Err(WalError::Closed)
        ));
        // Replay still works on a closed log.
        assert_eq!(wal.records().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let wal = std::sync::Arc::new(
            Wal::open(test_config(tmp.path()).with_sync_policy(SyncPolicy::Never)).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let wal = std::sync::Arc::clone(&wal);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        wal.append(txn(t * 100 + i), Role::Participant, LogPayload::End)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let records = wal.records().unwrap();
        assert_eq!(records.len(), 100);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.lsn(), Lsn::new(i as u64 + 1));
        }
    }
}
