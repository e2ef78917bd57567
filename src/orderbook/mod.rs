//! Order book module
//!
//! Maintains synchronized order book replicas from Binance depth diffs,
//! with segment-specific continuity rules.

mod book;
mod store;

pub use book::{OrderBookReplica, MAJOR_PAIRS, REPLICA_MAX_AGE_SECS};
pub use store::OrderBookStore;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange market segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Spot,
    Futures,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Spot => write!(f, "spot"),
            Segment::Futures => write!(f, "futures"),
        }
    }
}

/// Identifies one replica: upper-case symbol plus segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub symbol: String,
    pub segment: Segment,
}

impl PairKey {
    pub fn new(symbol: impl Into<String>, segment: Segment) -> Self {
        Self {
            symbol: symbol.into(),
            segment,
        }
    }

    pub fn spot(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Segment::Spot)
    }

    pub fn futures(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Segment::Futures)
    }

    /// Synthetic key for the combined futures stream in the retry queue
    /// and failure tables.
    pub fn combined_futures() -> Self {
        Self::new("combined", Segment::Futures)
    }

    pub fn is_combined(&self) -> bool {
        self.symbol == "combined"
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.symbol)
    }
}

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Outcome of applying one depth diff to a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Diff applied, replica advanced
    Applied,
    /// Diff entirely behind the replica; discarded without side effects
    Stale,
    /// Lost updates detected; replica marked for resync
    Gap,
    /// No replica exists for this key
    MissingReplica,
    /// Diff discarded without advancing (futures tolerance window)
    NotReady,
}

/// Read view of a replica, taken under the store lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaView {
    pub symbol: String,
    pub segment: Segment,
    pub last_update_id: u64,
    pub timestamp_ms: i64,
    pub age_seconds: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl ReplicaView {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}
