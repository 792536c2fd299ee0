//! Lock management for strict two-phase locking.
//!
//! This module implements the per-node lock manager:
//! - Shared (S) and exclusive (X) locks on named resources
//! - Lock upgrading from S to X when the requester is the only holder
//! - FIFO wait queues; waiters are woken through a oneshot channel
//! - Bounded waits: a request that times out is removed from its queue
//! - Strictness: once a transaction releases its locks it may take no more
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ S  │ X  │
//! ─────────┼────┼────┤
//!     S    │ ✓  │ ✗  │
//!     X    │ ✗  │ ✗  │
//! ```
//!
//! The whole table sits behind one latch that is never held across an
//! await point. A blocked request parks on its own channel, so waiting
//! never holds up transactions working on other resources.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_common::constants::DEFAULT_LOCK_TIMEOUT_MS;
use concord_common::types::TxnId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::deadlock::{DeadlockPolicy, TimeoutOnly, WaitForGraph};
use crate::error::LockError;

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock (read lock).
    Shared,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Returns true if holding `self` already satisfies a request for `other`.
    pub fn covers(&self, other: &LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared)
        )
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Identifies a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the resource name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Result of a successful lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock was granted.
    Granted,
    /// Lock was upgraded from shared to exclusive.
    Upgraded,
    /// Transaction already holds a covering lock.
    AlreadyHeld,
    /// The request could not be granted without waiting (try only).
    WouldBlock,
}

impl LockResult {
    /// Returns true if the lock is now held.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            LockResult::Granted | LockResult::Upgraded | LockResult::AlreadyHeld
        )
    }
}

/// A parked lock request.
struct Waiter {
    id: u64,
    txn_id: TxnId,
    mode: LockMode,
    upgrade: bool,
    notify: oneshot::Sender<()>,
}

/// State of one resource.
struct LockEntry {
    /// Current lock mode.
    mode: LockMode,
    /// Transactions holding the lock.
    holders: HashSet<TxnId>,
    /// Queue of waiting lock requests.
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mode: LockMode::Shared, // set on first grant
            holders: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    /// Checks if a lock mode can be granted, ignoring the queue.
    fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        if self.holders.is_empty() {
            return true;
        }
        if self.holders.contains(&txn_id) {
            return self.mode.covers(&mode) || self.holders.len() == 1;
        }
        mode.is_compatible_with(&self.mode)
    }

    fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        if self.holders.is_empty() || mode == LockMode::Exclusive {
            self.mode = mode;
        }
        self.holders.insert(txn_id);
    }

    /// Transactions a new request by `txn_id` would wait behind.
    fn blockers(&self, txn_id: TxnId) -> Vec<TxnId> {
        self.holders
            .iter()
            .copied()
            .chain(self.queue.iter().map(|w| w.txn_id))
            .filter(|t| *t != txn_id)
            .collect()
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<ResourceId, LockEntry>,
    held: HashMap<TxnId, HashMap<ResourceId, LockMode>>,
    shrinking: HashSet<TxnId>,
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total lock waits.
    pub waits: AtomicU64,
    /// Total deadlocks detected.
    pub deadlocks: AtomicU64,
    /// Total lock upgrades.
    pub upgrades: AtomicU64,
    /// Total timeouts.
    pub timeouts: AtomicU64,
}

impl LockStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Default lock timeout.
    pub lock_timeout: Duration,
    /// Whether to refuse waits that close a wait-for cycle.
    pub deadlock_detection: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            deadlock_detection: false,
        }
    }
}

impl LockManagerConfig {
    /// Creates a configuration with the given lock timeout.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..Default::default()
        }
    }

    /// Enables or disables wait-for-graph deadlock detection.
    #[must_use]
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }
}

/// The lock manager for managing transaction locks.
pub struct LockManager {
    table: Mutex<LockTable>,
    policy: Arc<dyn DeadlockPolicy>,
    config: LockManagerConfig,
    next_waiter: AtomicU64,
    stats: LockStats,
}

impl LockManager {
    /// Creates a new lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager whose deadlock policy follows the config.
    pub fn with_config(config: LockManagerConfig) -> Self {
        let policy: Arc<dyn DeadlockPolicy> = if config.deadlock_detection {
            Arc::new(WaitForGraph::new())
        } else {
            Arc::new(TimeoutOnly)
        };
        Self::with_policy(config, policy)
    }

    /// Creates a lock manager with an explicit deadlock policy.
    pub fn with_policy(config: LockManagerConfig, policy: Arc<dyn DeadlockPolicy>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            policy,
            config,
            next_waiter: AtomicU64::new(1),
            stats: LockStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Returns the active deadlock policy.
    pub fn policy(&self) -> &dyn DeadlockPolicy {
        self.policy.as_ref()
    }

    /// Tries to acquire a lock without waiting.
    pub fn try_acquire(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
    ) -> Result<LockResult, LockError> {
        let mut table = self.table.lock();
        let result = self.try_grant(&mut table, txn_id, resource, mode);
        if let Some(entry) = table.entries.get(resource) {
            if entry.is_free() {
                table.entries.remove(resource);
            }
        }
        result
    }

    /// Acquires a lock, waiting until it is granted or the wait expires.
    ///
    /// `timeout` defaults to the configured lock timeout. On expiry the
    /// request is removed from the queue and [`LockError::Timeout`] is
    /// returned; nothing is left behind for the caller to clean up.
    pub async fn acquire(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        let timeout = timeout.unwrap_or(self.config.lock_timeout);

        let (mut rx, waiter_id, upgrade) = {
            let mut table = self.table.lock();
            match self.try_grant(&mut table, txn_id, resource, mode)? {
                LockResult::WouldBlock => {}
                granted => return Ok(granted),
            }

            let entry = table
                .entries
                .entry(resource.clone())
                .or_insert_with(LockEntry::new);
            let upgrade = entry.holders.contains(&txn_id);
            let blockers = entry.blockers(txn_id);

            if let Err(cycle) = self.policy.before_wait(txn_id, &blockers) {
                LockStats::record(&self.stats.deadlocks);
                warn!(txn = %txn_id, resource = %resource, ?cycle, "lock wait refused: deadlock");
                return Err(LockError::Deadlock {
                    txn: txn_id,
                    resource: resource.to_string(),
                    cycle,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter.fetch_add(1, AtomicOrdering::Relaxed);
            let waiter = Waiter {
                id,
                txn_id,
                mode,
                upgrade,
                notify: tx,
            };
            // Upgrades go first: nobody queued behind can be granted while
            // the upgrader still holds its shared lock anyway.
            if upgrade {
                entry.queue.push_front(waiter);
            } else {
                entry.queue.push_back(waiter);
            }
            LockStats::record(&self.stats.waits);
            debug!(txn = %txn_id, resource = %resource, mode = %mode, ?blockers, "waiting for lock");
            (rx, id, upgrade)
        };

        let granted = if upgrade {
            LockResult::Upgraded
        } else {
            LockResult::Granted
        };
        let started = Instant::now();

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(())) => Ok(granted),
            Ok(Err(_)) => Err(LockError::Shrinking { txn: txn_id }),
            Err(_) => {
                let mut table = self.table.lock();
                let removed = table
                    .entries
                    .get_mut(resource)
                    .and_then(|entry| {
                        let pos = entry.queue.iter().position(|w| w.id == waiter_id)?;
                        entry.queue.remove(pos)
                    })
                    .is_some();

                if !removed {
                    // Granted or cancelled between the timer and the latch.
                    return match rx.try_recv() {
                        Ok(()) => Ok(granted),
                        Err(_) => Err(LockError::Shrinking { txn: txn_id }),
                    };
                }

                self.policy.after_wait(txn_id);
                self.grant_waiters(&mut table, resource);
                LockStats::record(&self.stats.timeouts);
                warn!(
                    txn = %txn_id,
                    resource = %resource,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock wait timed out"
                );
                Err(LockError::Timeout {
                    txn: txn_id,
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Releases every lock held by a transaction and drops its queued
    /// requests. The transaction may not acquire locks afterwards, until
    /// [`forget`](Self::forget) is called for it.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut table = self.table.lock();
        table.shrinking.insert(txn_id);

        let mut touched: Vec<ResourceId> = Vec::new();
        for (resource, entry) in table.entries.iter_mut() {
            let before = entry.queue.len();
            entry.queue.retain(|w| w.txn_id != txn_id);
            if entry.queue.len() != before {
                touched.push(resource.clone());
            }
        }

        let held = table.held.remove(&txn_id).unwrap_or_default();
        for resource in held.keys() {
            if let Some(entry) = table.entries.get_mut(resource) {
                if entry.holders.remove(&txn_id) {
                    LockStats::record(&self.stats.releases);
                }
            }
            touched.push(resource.clone());
        }

        self.policy.finished(txn_id);
        for resource in &touched {
            self.grant_waiters(&mut table, resource);
        }

        if !held.is_empty() {
            debug!(txn = %txn_id, count = held.len(), "released locks");
        }
        held.len()
    }

    fn try_grant(
        &self,
        table: &mut LockTable,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
    ) -> Result<LockResult, LockError> {
        if table.shrinking.contains(&txn_id) {
            return Err(LockError::Shrinking { txn: txn_id });
        }

        let entry = table
            .entries
            .entry(resource.clone())
            .or_insert_with(LockEntry::new);

        if entry.holders.contains(&txn_id) {
            if entry.mode.covers(&mode) {
                return Ok(LockResult::AlreadyHeld);
            }
            if entry.holders.len() == 1 {
                entry.mode = LockMode::Exclusive;
                table
                    .held
                    .entry(txn_id)
                    .or_default()
                    .insert(resource.clone(), LockMode::Exclusive);
                LockStats::record(&self.stats.upgrades);
                return Ok(LockResult::Upgraded);
            }
            return Ok(LockResult::WouldBlock);
        }

        if entry.queue.is_empty() && entry.can_grant(txn_id, mode) {
            entry.grant(txn_id, mode);
            table
                .held
                .entry(txn_id)
                .or_default()
                .insert(resource.clone(), mode);
            LockStats::record(&self.stats.acquisitions);
            return Ok(LockResult::Granted);
        }

        Ok(LockResult::WouldBlock)
    }

    /// Grants queued requests at the head of a resource's queue.
    fn grant_waiters(&self, table: &mut LockTable, resource: &ResourceId) {
        let Some(entry) = table.entries.get_mut(resource) else {
            return;
        };

        loop {
            let (abandoned, grantable) = match entry.queue.front() {
                Some(front) => (
                    front.notify.is_closed(),
                    entry.can_grant(front.txn_id, front.mode),
                ),
                None => break,
            };
            if !abandoned && !grantable {
                break;
            }
            let Some(waiter) = entry.queue.pop_front() else {
                break;
            };
            self.policy.after_wait(waiter.txn_id);
            if abandoned {
                continue;
            }

            let previous = entry.mode;
            entry.grant(waiter.txn_id, waiter.mode);
            if waiter.notify.send(()).is_err() {
                // The requester went away after all.
                if waiter.upgrade {
                    entry.mode = previous;
                } else {
                    entry.holders.remove(&waiter.txn_id);
                }
                continue;
            }

            table
                .held
                .entry(waiter.txn_id)
                .or_default()
                .insert(resource.clone(), waiter.mode);
            if waiter.upgrade {
                LockStats::record(&self.stats.upgrades);
            } else {
                LockStats::record(&self.stats.acquisitions);
            }
            debug!(txn = %waiter.txn_id, resource = %resource, mode = %waiter.mode, "lock granted to waiter");
        }

        if entry.is_free() {
            table.entries.remove(resource);
        }
    }

    /// Returns the holders of a resource with the mode they hold.
    pub fn holders(&self, resource: &ResourceId) -> Vec<(TxnId, LockMode)> {
        let table = self.table.lock();
        let mut holders: Vec<_> = table
            .entries
            .get(resource)
            .map(|e| e.holders.iter().map(|t| (*t, e.mode)).collect())
            .unwrap_or_default();
        holders.sort_by_key(|(t, _)| *t);
        holders
    }

    /// Returns the locks held by a transaction, ordered by resource.
    pub fn locks_of(&self, txn_id: TxnId) -> Vec<(ResourceId, LockMode)> {
        let table = self.table.lock();
        let mut locks: Vec<_> = table
            .held
            .get(&txn_id)
            .map(|m| m.iter().map(|(r, mode)| (r.clone(), *mode)).collect())
            .unwrap_or_default();
        locks.sort_by(|a, b| a.0.cmp(&b.0));
        locks
    }

    /// Returns the number of requests queued on a resource.
    pub fn waiting(&self, resource: &ResourceId) -> usize {
        self.table
            .lock()
            .entries
            .get(resource)
            .map(|e| e.queue.len())
            .unwrap_or(0)
    }

    /// Returns true once `release_all` has run for the transaction.
    pub fn is_shrinking(&self, txn_id: TxnId) -> bool {
        self.table.lock().shrinking.contains(&txn_id)
    }

    /// Drops what is remembered about a finished transaction. The caller
    /// must refuse further work for it on its own.
    pub fn forget(&self, txn_id: TxnId) {
        let mut table = self.table.lock();
        if table.held.contains_key(&txn_id) {
            warn!(txn = %txn_id, "forgetting a transaction that still holds locks");
            return;
        }
        table.shrinking.remove(&txn_id);
    }

    /// Returns how many finished transactions are remembered.
    pub fn shrinking_count(&self) -> usize {
        self.table.lock().shrinking.len()
    }

    /// Returns the number of locked or contended resources.
    pub fn lock_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Returns the number of transactions holding locks.
    pub fn txn_count(&self) -> usize {
        self.table.lock().held.len()
    }

    /// Returns statistics about the lock manager.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("policy", &self.policy.name())
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .finish()
    }
}
