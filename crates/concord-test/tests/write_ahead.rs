//! Every protocol message is preceded by the log record that justifies it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use concord_commit::transport::BoxFuture;
use concord_commit::{
    CoordinatorState, Request, Response, SubmitMode, TransactionRequest, Transport,
    TransportResult,
};
use concord_common::config::NodeConfig;
use concord_common::types::{Decision, NodeId, TxnId, Vote};
use concord_test::TestCluster;
use concord_wal::reader::WalReader;
use concord_wal::{LogPayload, LogRecord, RecordKind, Role, WalConfig};

fn n(id: u32) -> NodeId {
    NodeId::new(id)
}

fn records(dir: PathBuf) -> Vec<LogRecord> {
    let config = WalConfig::new(dir);
    WalReader::new(&config).scan().unwrap().records
}

#[derive(Default)]
struct Audit {
    checked: AtomicU64,
    violations: AtomicU64,
}

impl Audit {
    fn check(&self, ok: bool) {
        self.checked.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Inspects the logs around every outbound call.
struct Auditor {
    inner: Arc<dyn Transport>,
    /// Log directory of the sending node.
    own_wal: PathBuf,
    /// Parent of every node's log directory.
    root: PathBuf,
    audit: Arc<Audit>,
}

impl Auditor {
    fn has_record(
        dir: PathBuf,
        txn: TxnId,
        role: Role,
        matches: impl Fn(&LogPayload) -> bool,
    ) -> bool {
        records(dir)
            .iter()
            .any(|r| r.txn_id() == txn && r.role() == Some(role) && matches(&r.payload))
    }
}

impl Transport for Auditor {
    fn local_id(&self) -> NodeId {
        self.inner.local_id()
    }

    fn call(&self, to: NodeId, request: Request) -> BoxFuture<'_, TransportResult<Response>> {
        Box::pin(async move {
            // Outbound: a decision is only sent once it is in the log.
            match &request {
                Request::Commit { txn } | Request::Abort { txn } => {
                    let expected = if matches!(request, Request::Commit { .. }) {
                        Decision::Commit
                    } else {
                        Decision::Abort
                    };
                    let ok = Self::has_record(self.own_wal.clone(), *txn, Role::Coordinator, |p| {
                        matches!(p, LogPayload::Decision { decision } if *decision == expected)
                    });
                    self.audit.check(ok);
                }
                Request::Prepare { txn, .. } => {
                    let ok = Self::has_record(self.own_wal.clone(), *txn, Role::Coordinator, |p| {
                        matches!(p, LogPayload::Prepare { .. })
                    });
                    self.audit.check(ok);
                }
                _ => {}
            }

            let txn = request.txn();
            let response = self.inner.call(to, request).await?;

            // Inbound: a commit vote is only cast once it is in the voter's log.
            if let (Some(txn), Response::Vote { vote: Vote::Commit }) = (txn, &response) {
                let dir = self.root.join(format!("node{}", to));
                let ok = Self::has_record(dir, txn, Role::Participant, |p| {
                    matches!(p, LogPayload::Vote { vote: Vote::Commit, .. })
                });
                self.audit.check(ok);
            }
            Ok(response)
        })
    }
}

fn audited_cluster(size: u32, audit: &Arc<Audit>) -> TestCluster {
    let audit = Arc::clone(audit);
    TestCluster::builder(size)
        .with_transport(move |config: &NodeConfig, inner| {
            Arc::new(Auditor {
                inner,
                own_wal: config.wal_dir.clone(),
                root: config.wal_dir.parent().map(PathBuf::from).unwrap_or_default(),
                audit: Arc::clone(&audit),
            }) as Arc<dyn Transport>
        })
        .build()
}

#[tokio::test]
async fn test_messages_follow_their_log_records() {
    let audit = Arc::new(Audit::default());
    let cluster = audited_cluster(3, &audit);

    let commit = TransactionRequest::transfer(n(2), "a", n(3), "a", 10);
    let t1 = cluster.node(1).submit(commit, SubmitMode::Sync).await.unwrap();
    assert_eq!(cluster.node(1).coordinator_state(t1), Some(CoordinatorState::Committed));

    cluster.node(3).simulate_reject(true).unwrap();
    let abort = TransactionRequest::transfer(n(2), "b", n(3), "b", 10);
    let t2 = cluster.node(1).submit(abort, SubmitMode::Sync).await.unwrap();
    assert_eq!(cluster.node(1).coordinator_state(t2), Some(CoordinatorState::Aborted));

    // Prepares, decisions and commit votes of both transactions.
    assert!(audit.checked.load(Ordering::SeqCst) >= 9);
    assert_eq!(audit.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_coordinator_log_order() {
    let cluster = TestCluster::new(3);
    let request = TransactionRequest::transfer(n(2), "c", n(3), "c", 5);
    let txn = cluster.node(1).submit(request, SubmitMode::Sync).await.unwrap();

    let log: Vec<_> = records(cluster.node(1).wal_dir())
        .into_iter()
        .filter(|r| r.txn_id() == txn && r.role() == Some(Role::Coordinator))
        .map(|r| (r.kind(), r.lsn()))
        .collect();
    let kinds: Vec<RecordKind> = log.iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![RecordKind::Begin, RecordKind::Prepare, RecordKind::Decision, RecordKind::End]
    );
    assert!(log.windows(2).all(|w| w[0].1 < w[1].1));
}

#[tokio::test]
async fn test_participant_log_order() {
    let cluster = TestCluster::new(3);
    let request = TransactionRequest::transfer(n(2), "c", n(3), "c", 5);
    let txn = cluster.node(1).submit(request, SubmitMode::Sync).await.unwrap();

    let kinds: Vec<RecordKind> = records(cluster.node(2).wal_dir())
        .into_iter()
        .filter(|r| r.txn_id() == txn)
        .map(|r| r.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![RecordKind::Operation, RecordKind::Vote, RecordKind::Decision]
    );
}

#[tokio::test]
async fn test_execution_failure_logs_no_prepare() {
    let cluster = TestCluster::new(3);
    // Node 3 has no such account to read.
    let request = TransactionRequest::new(vec![n(2), n(3)])
        .with_operation(n(2), concord_txn::Operation::add("a", -1))
        .with_operation(n(3), concord_txn::Operation::read("missing"));
    let txn = cluster.node(1).submit(request, SubmitMode::Sync).await.unwrap();
    assert_eq!(cluster.node(1).coordinator_state(txn), Some(CoordinatorState::Aborted));

    let kinds: Vec<RecordKind> = records(cluster.node(1).wal_dir())
        .into_iter()
        .filter(|r| r.txn_id() == txn)
        .map(|r| r.kind())
        .collect();
    assert!(!kinds.contains(&RecordKind::Prepare));
    assert_eq!(kinds.first(), Some(&RecordKind::Begin));
    assert_eq!(kinds.last(), Some(&RecordKind::End));
    assert_eq!(cluster.balance(2, "a"), Some(100));
}
