//! Liquidity metrics
//!
//! Derived per-replica metrics computed on every applied update and
//! persisted to the time-series store at a throttled cadence.

mod compute;
mod engine;

pub use compute::{
    compute_bundle, depth_within, deviation_set, liquidity_score, slippage,
    slippage_ladder, slippage_sentinel, MetricsBundle,
};
pub use engine::MetricsEngine;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Core liquidity record, one row per persisted computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreMetricsRecord {
    pub timestamp_ms: i64,
    pub spread_percent: Decimal,
    pub total_depth: Decimal,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub slippage_100k: Decimal,
    pub slippage_1m: Decimal,
    pub liquidity_score: u32,
    pub imbalance: Decimal,
    pub mid_price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

/// Slippage in percent for the standard trade notionals, both directions.
/// Sell-side figures are negative; 999 marks a side too thin for the size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageLadder {
    pub buy_100k: Decimal,
    pub buy_300k: Decimal,
    pub buy_500k: Decimal,
    pub buy_1m: Decimal,
    pub buy_5m: Decimal,
    pub sell_100k: Decimal,
    pub sell_300k: Decimal,
    pub sell_500k: Decimal,
    pub sell_1m: Decimal,
    pub sell_5m: Decimal,
}

/// Advanced depth record: deviation-band depth and impact cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedMetricsRecord {
    pub timestamp_ms: i64,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub impact_cost_avg: Decimal,
    pub depth_deviation_bid: Decimal,
    pub depth_deviation_ask: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// Deviation band the depth figures refer to ("0.10%" for major pairs)
    pub deviation_label: String,
}
