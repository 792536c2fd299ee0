//! Deadlock handling strategies.
//!
//! The lock manager consults a [`DeadlockPolicy`] every time a request
//! cannot be granted and is about to wait. Two policies are provided:
//!
//! - [`TimeoutOnly`]: every wait is allowed; a deadlock resolves when one
//!   of the waiters hits its lock timeout and aborts.
//! - [`WaitForGraph`]: tracks which transaction waits for which and
//!   refuses a wait that would close a cycle. The requester is the victim.
//!
//! An edge `T1 -> T2` means T1 is queued behind a lock T2 holds. A wait
//! is refused when the new edges would let the waiter reach itself.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use concord_common::types::TxnId;
use parking_lot::Mutex;

/// Strategy deciding whether a blocked request may wait.
///
/// All methods are called with the lock table latched, so implementations
/// see a consistent view and must not block.
pub trait DeadlockPolicy: Send + Sync + fmt::Debug {
    /// Short name for logs and status output.
    fn name(&self) -> &'static str;

    /// `waiter` is about to wait for `blockers`.
    ///
    /// Returns the cycle if waiting would deadlock; the request is then
    /// refused and the waiter should abort.
    fn before_wait(&self, waiter: TxnId, blockers: &[TxnId]) -> Result<(), Vec<TxnId>>;

    /// `waiter` stopped waiting (granted, timed out or cancelled).
    fn after_wait(&self, waiter: TxnId);

    /// `txn` released all its locks.
    fn finished(&self, txn: TxnId);
}

/// Relies on lock timeouts alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeoutOnly;

impl DeadlockPolicy for TimeoutOnly {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn before_wait(&self, _waiter: TxnId, _blockers: &[TxnId]) -> Result<(), Vec<TxnId>> {
        Ok(())
    }

    fn after_wait(&self, _waiter: TxnId) {}

    fn finished(&self, _txn: TxnId) {}
}

/// Counters kept by [`WaitForGraph`].
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Waits examined.
    pub checks: AtomicU64,
    /// Waits refused because they closed a cycle.
    pub deadlocks_found: AtomicU64,
}

/// Refuses waits that would close a cycle of waiting transactions.
#[derive(Default)]
pub struct WaitForGraph {
    /// Waiter to the holders it is queued behind.
    waits: Mutex<HashMap<TxnId, HashSet<TxnId>>>,
    stats: DeadlockStats,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions `waiter` is currently queued behind.
    pub fn waits_of(&self, waiter: TxnId) -> Vec<TxnId> {
        let mut holders: Vec<TxnId> = self
            .waits
            .lock()
            .get(&waiter)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    pub fn edge_count(&self) -> usize {
        self.waits.lock().values().map(HashSet::len).sum()
    }

    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }
}

/// Path `start -> ... -> x` where `x` waits for `start`, found by an
/// iterative depth-first walk over `waits`.
fn cycle_through(waits: &HashMap<TxnId, HashSet<TxnId>>, start: TxnId) -> Option<Vec<TxnId>> {
    let mut parent: HashMap<TxnId, TxnId> = HashMap::new();
    let mut seen: HashSet<TxnId> = HashSet::from([start]);
    let mut stack = vec![start];

    while let Some(txn) = stack.pop() {
        for &next in waits.get(&txn).into_iter().flatten() {
            if next == start {
                let mut path = vec![txn];
                let mut at = txn;
                while let Some(&p) = parent.get(&at) {
                    path.push(p);
                    at = p;
                }
                path.reverse();
                return Some(path);
            }
            if seen.insert(next) {
                parent.insert(next, txn);
                stack.push(next);
            }
        }
    }
    None
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("edges", &self.edge_count())
            .finish()
    }
}

impl DeadlockPolicy for WaitForGraph {
    fn name(&self) -> &'static str {
        "wait-for-graph"
    }

    fn before_wait(&self, waiter: TxnId, blockers: &[TxnId]) -> Result<(), Vec<TxnId>> {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let mut waits = self.waits.lock();
        waits
            .entry(waiter)
            .or_default()
            .extend(blockers.iter().copied().filter(|&b| b != waiter));

        match cycle_through(&waits, waiter) {
            Some(cycle) => {
                waits.remove(&waiter);
                self.stats.deadlocks_found.fetch_add(1, Ordering::Relaxed);
                Err(cycle)
            }
            None => Ok(()),
        }
    }

    fn after_wait(&self, waiter: TxnId) {
        self.waits.lock().remove(&waiter);
    }

    fn finished(&self, txn: TxnId) {
        let mut waits = self.waits.lock();
        waits.remove(&txn);
        waits.retain(|_, holders| {
            holders.remove(&txn);
            !holders.is_empty()
        });
    }
}
