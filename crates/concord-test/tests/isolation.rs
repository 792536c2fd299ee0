//! Strict two-phase locking on a participant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use concord_commit::{
    Participant, ParticipantConfig, ParticipantState, SubmitMode, TransactionRequest, TxnError,
};
use concord_common::types::{Decision, NodeId, TxnId, Vote};
use concord_test::TestCluster;
use concord_txn::{LockManager, LockManagerConfig, MemoryStore, Operation, ResourceManager};
use concord_wal::{SyncPolicy, Wal, WalConfig};

fn txn(seq: u64) -> TxnId {
    TxnId::compose(NodeId::new(1), seq)
}

fn participant(dir: &TempDir, lock_timeout: Duration) -> Arc<Participant> {
    let wal = Wal::open(WalConfig::new(dir.path()).with_sync_policy(SyncPolicy::Never)).unwrap();
    let mut seed = BTreeMap::new();
    seed.insert("alice".to_string(), 100);
    seed.insert("bob".to_string(), 100);
    Arc::new(Participant::new(
        NodeId::new(2),
        Arc::new(wal),
        Arc::new(LockManager::with_config(LockManagerConfig::new(lock_timeout))),
        Arc::new(MemoryStore::with_accounts(seed)),
        ParticipantConfig {
            lock_timeout,
            ..ParticipantConfig::default()
        },
    ))
}

#[tokio::test]
async fn test_reader_waits_for_writer_commit() {
    let dir = TempDir::new().unwrap();
    let p = participant(&dir, Duration::from_secs(5));
    let (writer, reader) = (txn(1), txn(2));

    p.execute(writer, Operation::add("alice", -40)).await.unwrap();

    let pending = tokio::spawn({
        let p = Arc::clone(&p);
        async move { p.execute(reader, Operation::read("alice")).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished(), "read must not see uncommitted data");

    assert_eq!(p.on_prepare(writer, vec![NodeId::new(2)], 1).await, Vote::Commit);
    // Still prepared, still locked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    p.on_commit(writer).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, Some(60));
}

#[tokio::test]
async fn test_reader_sees_before_image_after_abort() {
    let dir = TempDir::new().unwrap();
    let p = participant(&dir, Duration::from_secs(5));
    let (writer, reader) = (txn(1), txn(2));

    p.execute(writer, Operation::set("bob", 7)).await.unwrap();
    let pending = tokio::spawn({
        let p = Arc::clone(&p);
        async move { p.execute(reader, Operation::read("bob")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    p.on_abort(writer).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, Some(100));
}

#[tokio::test]
async fn test_shared_readers_do_not_block() {
    let dir = TempDir::new().unwrap();
    let p = participant(&dir, Duration::from_millis(100));

    assert_eq!(p.execute(txn(1), Operation::read("alice")).await.unwrap(), Some(100));
    assert_eq!(p.execute(txn(2), Operation::read("alice")).await.unwrap(), Some(100));
    assert_eq!(p.locks().txn_count(), 2);

    // A writer has to wait for both readers and gives up.
    let err = p.execute(txn(3), Operation::add("alice", 1)).await.unwrap_err();
    assert!(matches!(err, TxnError::LockTimeout { .. } | TxnError::Deadlock { .. }), "{:?}", err);
    assert_eq!(p.state(txn(3)), Some(ParticipantState::Aborted));
    assert_eq!(p.store().read("alice").unwrap(), 100);
}

#[tokio::test]
async fn test_no_operations_after_decision() {
    let dir = TempDir::new().unwrap();
    let p = participant(&dir, Duration::from_millis(100));
    let t = txn(1);

    p.execute(t, Operation::add("alice", 5)).await.unwrap();
    p.on_prepare(t, vec![NodeId::new(2)], 1).await;
    let err = p.execute(t, Operation::add("alice", 5)).await.unwrap_err();
    assert!(matches!(err, TxnError::InvalidState { .. }));

    p.on_commit(t).await.unwrap();
    let err = p.execute(t, Operation::read("alice")).await.unwrap_err();
    assert!(matches!(err, TxnError::InvalidState { .. }));
    assert_eq!(p.store().read("alice").unwrap(), 105);
    assert_eq!(p.locks().lock_count(), 0);
}

/// Conflicting transfers submitted at once end up serialized: the final
/// balances equal some serial order of the committed ones.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_transfers_serialize() {
    let cluster = TestCluster::new(2);
    let n = NodeId::new;

    let first = {
        let node = cluster.node(1).clone();
        tokio::spawn(async move {
            let request = TransactionRequest::transfer(n(1), "a", n(2), "a", 30);
            node.submit(request, SubmitMode::Sync).await
        })
    };
    let second = {
        let node = cluster.node(2).clone();
        tokio::spawn(async move {
            let request = TransactionRequest::transfer(n(1), "a", n(2), "a", 50);
            node.submit(request, SubmitMode::Sync).await
        })
    };
    let t1 = first.await.unwrap().unwrap();
    let t2 = second.await.unwrap().unwrap();

    let committed: i64 = [(1, t1, 30), (2, t2, 50)]
        .into_iter()
        .filter(|&(node, txn, _)| {
            cluster.node(node).transaction_status(txn).unwrap().decision
                == Some(Decision::Commit)
        })
        .map(|(_, _, amount)| amount)
        .sum();

    assert_eq!(cluster.balance(1, "a"), Some(100 - committed));
    assert_eq!(cluster.balance(2, "a"), Some(100 + committed));
    assert_eq!(cluster.locks_held(), 0);
}
