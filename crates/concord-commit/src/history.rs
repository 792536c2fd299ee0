//! Bounded memory of finished transactions.
//!
//! Coordinator and participant move a transaction here once it is
//! terminal, so late queries and duplicate messages still find its outcome.
//! The oldest entries are dropped first once `capacity` is reached.

use std::collections::{HashMap, VecDeque};

use concord_common::types::TxnId;

#[derive(Debug)]
pub(crate) struct History<V> {
    order: VecDeque<TxnId>,
    entries: HashMap<TxnId, V>,
    capacity: usize,
}

impl<V: Clone> History<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Records `txn`, replacing an earlier entry for it. Returns how many
    /// older entries were dropped to make room.
    pub(crate) fn insert(&mut self, txn: TxnId, value: V) -> usize {
        if self.entries.insert(txn, value).is_none() {
            self.order.push_back(txn);
        }
        let mut evicted = 0;
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted += 1;
            }
        }
        evicted
    }

    pub(crate) fn get(&self, txn: TxnId) -> Option<V> {
        self.entries.get(&txn).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries from newest to oldest.
    pub(crate) fn newest(&self) -> impl Iterator<Item = (TxnId, &V)> + '_ {
        self.order
            .iter()
            .rev()
            .filter_map(|txn| self.entries.get(txn).map(|v| (*txn, v)))
    }
}
