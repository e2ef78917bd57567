//! Core order book replica
//!
//! Uses BTreeMap for sorted price level management. Diff continuity rules
//! differ per segment: spot requires `U <= L+1 <= u`, futures chains events
//! through `pu` with a first-event coverage test and a small tolerance
//! window for transient stream losses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::warn;

use super::{ApplyOutcome, Level, PairKey, ReplicaView, Segment, Side};
use crate::parser::{DepthDiff, DepthSnapshot, PriceLevel};

/// Pairs kept at full depth
pub const MAJOR_PAIRS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];

/// Replicas older than this are zombies: unreadable and non-persistable
pub const REPLICA_MAX_AGE_SECS: i64 = 120;

/// Consecutive futures continuity failures tolerated before forcing a resync
const CONTINUITY_FAILURE_LIMIT: u8 = 3;

fn max_levels_for(symbol: &str) -> usize {
    if MAJOR_PAIRS.contains(&symbol) {
        500
    } else {
        300
    }
}

/// Local order book replica for a single pair
#[derive(Debug)]
pub struct OrderBookReplica {
    key: PairKey,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last applied update ID; snapshot id at init, then the `u` of each diff
    last_update_id: u64,
    /// Whether any diff has been applied since the last Initialize
    first_event_applied: bool,
    /// Set on gap detection; the replica is unreadable until re-initialized
    needs_resync: bool,
    /// Consecutive futures `pu` mismatches since the last success
    continuity_failures: u8,
    /// Maximum depth levels to maintain per side
    max_levels: usize,
    /// Wall clock of the last snapshot init or applied diff
    last_applied_at: DateTime<Utc>,
}

impl OrderBookReplica {
    /// Create a replica initialized from a REST snapshot
    pub fn from_snapshot(key: PairKey, snapshot: &DepthSnapshot) -> Self {
        let max_levels = max_levels_for(&key.symbol);
        let mut replica = Self {
            key,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            first_event_applied: false,
            needs_resync: false,
            continuity_failures: 0,
            max_levels,
            last_applied_at: Utc::now(),
        };
        replica.init_snapshot(snapshot);
        replica
    }

    /// Re-initialize from a fresh snapshot, discarding all current state
    pub fn init_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.price > Decimal::ZERO && level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }
        for level in &snapshot.asks {
            if level.price > Decimal::ZERO && level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.last_update_id;
        self.first_event_applied = false;
        self.needs_resync = false;
        self.continuity_failures = 0;
        self.last_applied_at = Utc::now();
        self.trim_depth();
    }

    /// Apply a depth diff under the continuity rules of this replica's segment
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> ApplyOutcome {
        match self.key.segment {
            Segment::Spot => self.apply_spot(diff),
            Segment::Futures => self.apply_futures(diff),
        }
    }

    /// Spot: `u <= L` is stale, `U > L+1` is a gap, otherwise apply.
    fn apply_spot(&mut self, diff: &DepthDiff) -> ApplyOutcome {
        let last = self.last_update_id;

        if diff.final_update_id <= last {
            return ApplyOutcome::Stale;
        }
        if diff.first_update_id > last + 1 {
            warn!(
                key = %self.key,
                expected = last + 1,
                got = diff.first_update_id,
                "Update gap detected, marking for resync"
            );
            self.needs_resync = true;
            return ApplyOutcome::Gap;
        }

        self.apply_level_changes(diff);
        ApplyOutcome::Applied
    }

    /// Futures: the first event after a snapshot only needs to cover
    /// `L+1`; subsequent events must chain through `pu == L`. A short run
    /// of broken chains is discarded without resync.
    fn apply_futures(&mut self, diff: &DepthDiff) -> ApplyOutcome {
        let last = self.last_update_id;

        if diff.final_update_id < last {
            return ApplyOutcome::Stale;
        }

        if !self.first_event_applied {
            let covers =
                diff.first_update_id <= last + 1 && last + 1 <= diff.final_update_id;
            if !covers {
                self.continuity_failures = 0;
                return ApplyOutcome::NotReady;
            }
        } else if diff.prev_final_update_id != Some(last) {
            self.continuity_failures += 1;
            if self.continuity_failures >= CONTINUITY_FAILURE_LIMIT {
                warn!(
                    key = %self.key,
                    expected_pu = last,
                    got_pu = ?diff.prev_final_update_id,
                    "Continuity lost after repeated mismatches, marking for resync"
                );
                self.continuity_failures = 0;
                self.needs_resync = true;
                return ApplyOutcome::Gap;
            }
            return ApplyOutcome::NotReady;
        }

        self.apply_level_changes(diff);
        self.continuity_failures = 0;
        ApplyOutcome::Applied
    }

    fn apply_level_changes(&mut self, diff: &DepthDiff) {
        self.apply_side(Side::Bid, &diff.bids);
        self.apply_side(Side::Ask, &diff.asks);
        self.last_update_id = diff.final_update_id;
        self.first_event_applied = true;
        self.last_applied_at = Utc::now();
        self.trim_depth();
    }

    /// Apply one side of a diff: drop corrupt entries, remove zero-quantity
    /// levels, set or insert the rest, then truncate.
    fn apply_side(&mut self, side: Side, levels: &[PriceLevel]) {
        let half = Decimal::new(5, 1);
        let best = match side {
            Side::Bid => self.best_bid(),
            Side::Ask => self.best_ask(),
        };

        for level in levels {
            if level.price <= Decimal::ZERO || level.quantity < Decimal::ZERO {
                continue;
            }
            if let Some(p0) = best {
                if (level.price - p0).abs() / p0 > half {
                    warn!(
                        key = %self.key,
                        price = %level.price,
                        best = %p0,
                        "Dropping level far outside the book"
                    );
                    continue;
                }
            }

            match side {
                Side::Bid => {
                    if level.quantity == Decimal::ZERO {
                        self.bids.remove(&Reverse(level.price));
                    } else {
                        self.bids.insert(Reverse(level.price), level.quantity);
                    }
                }
                Side::Ask => {
                    if level.quantity == Decimal::ZERO {
                        self.asks.remove(&level.price);
                    } else {
                        self.asks.insert(level.price, level.quantity);
                    }
                }
            }
        }
    }

    /// Trim both sides to max depth, discarding levels furthest from the top
    fn trim_depth(&mut self) {
        while self.bids.len() > self.max_levels {
            self.bids.pop_last();
        }
        while self.asks.len() > self.max_levels {
            self.asks.pop_last();
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn first_event_applied(&self) -> bool {
        self.first_event_applied
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn mark_needs_resync(&mut self) {
        self.needs_resync = true;
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_applied_at).num_seconds()
    }

    /// Whether this replica has gone without updates long enough to be
    /// considered dead data.
    pub fn is_zombie(&self, now: DateTime<Utc>) -> bool {
        self.age_seconds(now) > REPLICA_MAX_AGE_SECS
    }

    /// Snapshot the replica for readers
    pub fn view(&self, now: DateTime<Utc>) -> ReplicaView {
        ReplicaView {
            symbol: self.key.symbol.clone(),
            segment: self.key.segment,
            last_update_id: self.last_update_id,
            timestamp_ms: self.last_applied_at.timestamp_millis(),
            age_seconds: self.age_seconds(now),
            bids: self
                .bids
                .iter()
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, seconds: i64) {
        self.last_applied_at = self.last_applied_at - chrono::Duration::seconds(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
        PriceLevel { price, quantity }
    }

    fn spot_snapshot() -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: 100,
            bids: vec![level(dec!(10), dec!(1))],
            asks: vec![level(dec!(11), dec!(1))],
        }
    }

    fn spot_diff(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthDiff {
        DepthDiff {
            event_type: "depthUpdate".to_string(),
            event_time: 1_700_000_000_000,
            symbol: "XRPUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: None,
            bids,
            asks,
        }
    }

    fn futures_diff(
        first: u64,
        last: u64,
        pu: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> DepthDiff {
        DepthDiff {
            prev_final_update_id: Some(pu),
            ..spot_diff(first, last, bids, asks)
        }
    }

    fn spot_book() -> OrderBookReplica {
        OrderBookReplica::from_snapshot(PairKey::spot("XRPUSDT"), &spot_snapshot())
    }

    #[test]
    fn spot_happy_path_applies_and_advances() {
        let mut book = spot_book();
        let outcome =
            book.apply_diff(&spot_diff(101, 105, vec![level(dec!(10), dec!(2))], vec![]));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 105);
        let view = book.view(Utc::now());
        assert_eq!(view.bids, vec![Level { price: dec!(10), quantity: dec!(2) }]);
        assert!(book.first_event_applied());
    }

    #[test]
    fn spot_stale_diff_leaves_replica_untouched() {
        let mut book = spot_book();
        book.apply_diff(&spot_diff(101, 105, vec![level(dec!(10), dec!(2))], vec![]));
        let before = book.view(Utc::now());

        let outcome = book.apply_diff(&spot_diff(50, 100, vec![level(dec!(10), dec!(9))], vec![]));

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(book.last_update_id(), 105);
        let after = book.view(Utc::now());
        assert_eq!(before.bids, after.bids);
        assert_eq!(before.asks, after.asks);
    }

    #[test]
    fn spot_gap_marks_resync_without_applying() {
        let mut book = spot_book();
        book.apply_diff(&spot_diff(101, 105, vec![level(dec!(10), dec!(2))], vec![]));

        let outcome = book.apply_diff(&spot_diff(200, 210, vec![], vec![]));

        assert_eq!(outcome, ApplyOutcome::Gap);
        assert!(book.needs_resync());
        assert_eq!(book.last_update_id(), 105);
        let view = book.view(Utc::now());
        assert_eq!(view.bids, vec![Level { price: dec!(10), quantity: dec!(2) }]);
    }

    #[test]
    fn futures_first_event_tolerates_snapshot_overlap() {
        let snapshot = DepthSnapshot {
            last_update_id: 1000,
            bids: vec![level(dec!(9), dec!(1))],
            asks: vec![level(dec!(10), dec!(1))],
        };
        let mut book = OrderBookReplica::from_snapshot(PairKey::futures("XRPUSDT"), &snapshot);

        let outcome =
            book.apply_diff(&futures_diff(900, 1010, 750, vec![level(dec!(9), dec!(2))], vec![]));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 1010);
        assert!(!book.needs_resync());
        let view = book.view(Utc::now());
        assert_eq!(view.bids, vec![Level { price: dec!(9), quantity: dec!(2) }]);
    }

    #[test]
    fn futures_first_event_without_coverage_is_discarded() {
        let snapshot = DepthSnapshot {
            last_update_id: 1000,
            bids: vec![level(dec!(9), dec!(1))],
            asks: vec![level(dec!(10), dec!(1))],
        };
        let mut book = OrderBookReplica::from_snapshot(PairKey::futures("XRPUSDT"), &snapshot);

        // Starts after L+1: cannot cover the snapshot boundary.
        let outcome = book.apply_diff(&futures_diff(1005, 1010, 1004, vec![], vec![]));

        assert_eq!(outcome, ApplyOutcome::NotReady);
        assert!(!book.needs_resync());
        assert_eq!(book.last_update_id(), 1000);
    }

    #[test]
    fn futures_continuity_break_resyncs_on_third_strike() {
        let snapshot = DepthSnapshot {
            last_update_id: 1000,
            bids: vec![level(dec!(9), dec!(1))],
            asks: vec![level(dec!(10), dec!(1))],
        };
        let mut book = OrderBookReplica::from_snapshot(PairKey::futures("XRPUSDT"), &snapshot);

        assert_eq!(
            book.apply_diff(&futures_diff(900, 1010, 750, vec![level(dec!(9), dec!(2))], vec![])),
            ApplyOutcome::Applied
        );
        assert_eq!(
            book.apply_diff(&futures_diff(1011, 1012, 1010, vec![], vec![])),
            ApplyOutcome::Applied
        );
        assert_eq!(book.last_update_id(), 1012);

        let broken = |first: u64| futures_diff(first, first + 1, 9999, vec![], vec![]);
        assert_eq!(book.apply_diff(&broken(1020)), ApplyOutcome::NotReady);
        assert!(!book.needs_resync());
        assert_eq!(book.apply_diff(&broken(1030)), ApplyOutcome::NotReady);
        assert!(!book.needs_resync());
        assert_eq!(book.apply_diff(&broken(1040)), ApplyOutcome::Gap);
        assert!(book.needs_resync());
        assert_eq!(book.last_update_id(), 1012);
    }

    #[test]
    fn futures_success_resets_failure_counter() {
        let snapshot = DepthSnapshot {
            last_update_id: 1000,
            bids: vec![level(dec!(9), dec!(1))],
            asks: vec![level(dec!(10), dec!(1))],
        };
        let mut book = OrderBookReplica::from_snapshot(PairKey::futures("XRPUSDT"), &snapshot);
        book.apply_diff(&futures_diff(900, 1010, 750, vec![], vec![]));

        let broken = |first: u64| futures_diff(first, first + 1, 9999, vec![], vec![]);
        assert_eq!(book.apply_diff(&broken(1020)), ApplyOutcome::NotReady);
        assert_eq!(book.apply_diff(&broken(1030)), ApplyOutcome::NotReady);
        // A good event clears the window.
        assert_eq!(
            book.apply_diff(&futures_diff(1011, 1015, 1010, vec![], vec![])),
            ApplyOutcome::Applied
        );
        assert_eq!(book.apply_diff(&broken(1050)), ApplyOutcome::NotReady);
        assert!(!book.needs_resync());
    }

    #[test]
    fn initialize_round_trips_sorted_snapshot() {
        let snapshot = DepthSnapshot {
            last_update_id: 42,
            bids: vec![
                level(dec!(99), dec!(1)),
                level(dec!(101), dec!(2)),
                level(dec!(100), dec!(3)),
            ],
            asks: vec![
                level(dec!(103), dec!(1)),
                level(dec!(102), dec!(2)),
            ],
        };
        let book = OrderBookReplica::from_snapshot(PairKey::spot("XRPUSDT"), &snapshot);
        let view = book.view(Utc::now());

        let bid_prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<Decimal> = view.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(101), dec!(100), dec!(99)]);
        assert_eq!(ask_prices, vec![dec!(102), dec!(103)]);
        assert_eq!(book.last_update_id(), 42);
        assert!(!book.first_event_applied());
    }

    #[test]
    fn insert_then_zero_restores_prior_level_state() {
        let mut book = spot_book();
        book.apply_diff(&spot_diff(101, 102, vec![level(dec!(9.5), dec!(4))], vec![]));
        assert_eq!(book.view(Utc::now()).bids.len(), 2);

        book.apply_diff(&spot_diff(103, 104, vec![level(dec!(9.5), dec!(0))], vec![]));
        let view = book.view(Utc::now());
        assert_eq!(view.bids, vec![Level { price: dec!(10), quantity: dec!(1) }]);
    }

    #[test]
    fn sides_stay_ordered_and_uncrossed() {
        let mut book = spot_book();
        book.apply_diff(&spot_diff(
            101,
            110,
            vec![level(dec!(10.5), dec!(1)), level(dec!(9.8), dec!(2))],
            vec![level(dec!(10.9), dec!(1)), level(dec!(11.2), dec!(2))],
        ));

        let view = book.view(Utc::now());
        let bid_prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<Decimal> = view.asks.iter().map(|l| l.price).collect();

        let mut sorted_bids = bid_prices.clone();
        sorted_bids.sort_by(|a, b| b.cmp(a));
        let mut sorted_asks = ask_prices.clone();
        sorted_asks.sort();

        assert_eq!(bid_prices, sorted_bids);
        assert_eq!(ask_prices, sorted_asks);
        assert!(view.best_bid().unwrap() < view.best_ask().unwrap());
    }

    #[test]
    fn corrupt_and_far_levels_are_dropped() {
        let mut book = spot_book();
        book.apply_diff(&spot_diff(
            101,
            102,
            vec![
                level(dec!(-1), dec!(5)),
                level(dec!(10), dec!(-2)),
                // More than 50% away from the best bid of 10.
                level(dec!(30), dec!(5)),
                level(dec!(9.9), dec!(5)),
            ],
            vec![],
        ));

        let view = book.view(Utc::now());
        let prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(10), dec!(9.9)]);
    }

    #[test]
    fn depth_is_truncated_to_max_levels() {
        // Non-major pair: 300 levels per side.
        let bids: Vec<PriceLevel> = (0..400)
            .map(|i| level(Decimal::from(10_000 - i), dec!(1)))
            .collect();
        let asks: Vec<PriceLevel> = (0..400)
            .map(|i| level(Decimal::from(10_001 + i), dec!(1)))
            .collect();
        let snapshot = DepthSnapshot {
            last_update_id: 1,
            bids,
            asks,
        };
        let book = OrderBookReplica::from_snapshot(PairKey::spot("XRPUSDT"), &snapshot);

        let view = book.view(Utc::now());
        assert_eq!(view.bids.len(), 300);
        assert_eq!(view.asks.len(), 300);
        // Closest-to-top levels survive.
        assert_eq!(view.bids[0].price, dec!(10000));
        assert_eq!(view.asks[0].price, dec!(10001));
    }

    #[test]
    fn major_pairs_keep_deeper_books() {
        let bids: Vec<PriceLevel> = (0..600)
            .map(|i| level(Decimal::from(50_000 - i), dec!(1)))
            .collect();
        let snapshot = DepthSnapshot {
            last_update_id: 1,
            bids,
            asks: vec![level(dec!(50001), dec!(1))],
        };
        let book = OrderBookReplica::from_snapshot(PairKey::spot("BTCUSDT"), &snapshot);
        assert_eq!(book.view(Utc::now()).bids.len(), 500);
    }

    #[test]
    fn update_id_is_monotonic_across_applies() {
        let mut book = spot_book();
        let mut last = book.last_update_id();
        for (first, final_id) in [(101u64, 105u64), (106, 106), (90, 104), (107, 120)] {
            book.apply_diff(&spot_diff(first, final_id, vec![], vec![]));
            assert!(book.last_update_id() >= last);
            last = book.last_update_id();
        }
        assert_eq!(last, 120);
    }

    #[test]
    fn zombie_detection_after_quiet_period() {
        let mut book = spot_book();
        assert!(!book.is_zombie(Utc::now()));
        book.backdate(REPLICA_MAX_AGE_SECS + 10);
        assert!(book.is_zombie(Utc::now()));
    }
}
