//! Order book store
//!
//! Owns the replicas for all monitored pairs and enforces the read-side
//! zombie guard.

use chrono::Utc;
use prometheus::IntCounter;
use std::collections::HashMap;

use super::{ApplyOutcome, OrderBookReplica, PairKey, ReplicaView};
use crate::parser::{DepthDiff, DepthSnapshot};

struct StoreCounters {
    applied: IntCounter,
    stale: IntCounter,
    gaps: IntCounter,
    resyncs: IntCounter,
}

impl StoreCounters {
    fn register() -> Self {
        let make = |name: &str, help: &str| {
            let counter = IntCounter::new(name, help).expect("valid metric name");
            // A second store in the same process keeps a private counter.
            let _ = prometheus::default_registry().register(Box::new(counter.clone()));
            counter
        };
        Self {
            applied: make("orderbook_diffs_applied_total", "Depth diffs applied"),
            stale: make("orderbook_diffs_stale_total", "Stale depth diffs discarded"),
            gaps: make("orderbook_gaps_total", "Update gaps detected"),
            resyncs: make("orderbook_resyncs_total", "Replica re-initializations"),
        }
    }
}

/// Manages order book replicas for all monitored pairs
pub struct OrderBookStore {
    books: HashMap<PairKey, OrderBookReplica>,
    counters: StoreCounters,
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
            counters: StoreCounters::register(),
        }
    }

    /// Initialize (or re-initialize) a replica from a REST snapshot,
    /// replacing any existing one.
    pub fn initialize(&mut self, key: PairKey, snapshot: &DepthSnapshot) {
        match self.books.get_mut(&key) {
            Some(existing) => {
                existing.init_snapshot(snapshot);
                self.counters.resyncs.inc();
            }
            None => {
                self.books
                    .insert(key.clone(), OrderBookReplica::from_snapshot(key, snapshot));
            }
        }
    }

    /// Apply a depth diff to the replica for `key`
    pub fn apply_diff(&mut self, key: &PairKey, diff: &DepthDiff) -> ApplyOutcome {
        let Some(book) = self.books.get_mut(key) else {
            return ApplyOutcome::MissingReplica;
        };
        if book.needs_resync() {
            // Frozen until the supervisor re-initializes it.
            return ApplyOutcome::NotReady;
        }

        let outcome = book.apply_diff(diff);
        match outcome {
            ApplyOutcome::Applied => self.counters.applied.inc(),
            ApplyOutcome::Stale => self.counters.stale.inc(),
            ApplyOutcome::Gap => self.counters.gaps.inc(),
            _ => {}
        }
        outcome
    }

    /// Read a replica. Returns None for missing, resync-flagged, or zombie
    /// replicas; downstream consumers never see stale books.
    pub fn get(&self, key: &PairKey) -> Option<ReplicaView> {
        let book = self.books.get(key)?;
        let now = Utc::now();
        if book.needs_resync() || book.is_zombie(now) {
            return None;
        }
        Some(book.view(now))
    }

    pub fn mark_needs_resync(&mut self, key: &PairKey) {
        if let Some(book) = self.books.get_mut(key) {
            book.mark_needs_resync();
        }
    }

    pub fn clear(&mut self, key: &PairKey) {
        self.books.remove(key);
    }

    pub fn contains(&self, key: &PairKey) -> bool {
        self.books.contains_key(key)
    }

    pub fn last_update_id(&self, key: &PairKey) -> Option<u64> {
        self.books.get(key).map(|b| b.last_update_id())
    }

    /// Keys currently flagged for resync
    pub fn keys_needing_resync(&self) -> Vec<PairKey> {
        self.books
            .iter()
            .filter(|(_, b)| b.needs_resync())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<PairKey> {
        self.books.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, key: &PairKey, seconds: i64) {
        if let Some(book) = self.books.get_mut(key) {
            book.backdate(seconds);
        }
    }
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}
