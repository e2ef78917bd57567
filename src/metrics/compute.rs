//! Pure metric math over a replica view

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{AdvancedMetricsRecord, CoreMetricsRecord, SlippageLadder};
use crate::orderbook::{Level, ReplicaView, Side, MAJOR_PAIRS};

/// Returned when the book cannot absorb the requested notional
pub fn slippage_sentinel() -> Decimal {
    Decimal::from(999)
}

/// Both record classes computed from one replica view, plus the full
/// slippage ladder the core figures are derived from
#[derive(Debug, Clone)]
pub struct MetricsBundle {
    pub core: CoreMetricsRecord,
    pub advanced: AdvancedMetricsRecord,
    pub slippage: SlippageLadder,
}

/// Slippage in percent for consuming `notional` quote units from one side,
/// top-of-book first. Returns the 999 sentinel when the side is too thin.
pub fn slippage(levels: &[Level], notional: Decimal) -> Decimal {
    let Some(best) = levels.first().map(|l| l.price) else {
        return slippage_sentinel();
    };
    if notional <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut remaining = notional;
    let mut base_qty = Decimal::ZERO;
    for level in levels {
        let value = level.price * level.quantity;
        if value >= remaining {
            base_qty += remaining / level.price;
            remaining = Decimal::ZERO;
            break;
        }
        base_qty += level.quantity;
        remaining -= value;
    }
    if remaining > Decimal::ZERO || base_qty == Decimal::ZERO {
        return slippage_sentinel();
    }

    let weighted_avg = notional / base_qty;
    (weighted_avg - best) / best * Decimal::ONE_HUNDRED
}

/// Walk both sides at every standard trade size
pub fn slippage_ladder(view: &ReplicaView) -> SlippageLadder {
    let n100k = Decimal::new(100_000, 0);
    let n300k = Decimal::new(300_000, 0);
    let n500k = Decimal::new(500_000, 0);
    let n1m = Decimal::new(1_000_000, 0);
    let n5m = Decimal::new(5_000_000, 0);

    SlippageLadder {
        buy_100k: slippage(&view.asks, n100k),
        buy_300k: slippage(&view.asks, n300k),
        buy_500k: slippage(&view.asks, n500k),
        buy_1m: slippage(&view.asks, n1m),
        buy_5m: slippage(&view.asks, n5m),
        sell_100k: slippage(&view.bids, n100k),
        sell_300k: slippage(&view.bids, n300k),
        sell_500k: slippage(&view.bids, n500k),
        sell_1m: slippage(&view.bids, n1m),
        sell_5m: slippage(&view.bids, n5m),
    }
}

/// Quoted value on one side within a price bound (inclusive)
pub fn depth_within(levels: &[Level], bound: Decimal, side: Side) -> Decimal {
    levels
        .iter()
        .take_while(|l| match side {
            Side::Bid => l.price >= bound,
            Side::Ask => l.price <= bound,
        })
        .map(|l| l.price * l.quantity)
        .sum()
}

/// Active deviation fractions and the label of the widest band
pub fn deviation_set(symbol: &str) -> (Vec<Decimal>, &'static str) {
    if MAJOR_PAIRS.contains(&symbol) {
        (
            vec![
                Decimal::new(3, 4),  // 0.03%
                Decimal::new(5, 4),  // 0.05%
                Decimal::new(1, 3),  // 0.10%
            ],
            "0.10%",
        )
    } else {
        (
            vec![
                Decimal::new(3, 3),  // 0.30%
                Decimal::new(5, 3),  // 0.50%
                Decimal::new(1, 2),  // 1.00%
            ],
            "1.00%",
        )
    }
}

/// Composite 0-100 score of total near-book depth and spread tightness
pub fn liquidity_score(total_depth: Decimal, spread_percent: Decimal) -> u32 {
    let depth_term = (total_depth / Decimal::new(1_000_000, 0)).min(Decimal::ONE);
    let spread_term =
        (Decimal::ONE - spread_percent / Decimal::new(5, 2)).max(Decimal::ZERO);
    let score = Decimal::from(70) * depth_term + Decimal::from(30) * spread_term;
    score.round().to_u32().unwrap_or(0).min(100)
}

/// Compute both record classes. Returns None when either side is empty.
pub fn compute_bundle(view: &ReplicaView, timestamp_ms: i64) -> Option<MetricsBundle> {
    let best_bid = view.best_bid()?;
    let best_ask = view.best_ask()?;

    let mid_price = (best_bid + best_ask) / Decimal::TWO;
    let spread_percent = (best_ask - best_bid) / best_bid * Decimal::ONE_HUNDRED;

    // Depth inside the 0.1% window around the touch.
    let bid_depth = depth_within(&view.bids, best_bid * Decimal::new(999, 3), Side::Bid);
    let ask_depth = depth_within(&view.asks, best_ask * Decimal::new(1001, 3), Side::Ask);
    let total_depth = bid_depth + ask_depth;

    let imbalance = if total_depth > Decimal::ZERO {
        (bid_depth - ask_depth) / total_depth
    } else {
        Decimal::ZERO
    };

    let ladder = slippage_ladder(view);

    let sentinel = slippage_sentinel();
    let two_sided = |buy: Decimal, sell: Decimal| {
        if buy == sentinel || sell == sentinel {
            sentinel
        } else {
            (buy + sell.abs()) / Decimal::TWO
        }
    };
    let slippage_100k = two_sided(ladder.buy_100k, ladder.sell_100k);
    let slippage_1m = two_sided(ladder.buy_1m, ladder.sell_1m);

    // Impact cost is the 100k two-sided slippage as a fraction.
    let impact_cost_avg = if slippage_100k == sentinel {
        sentinel
    } else {
        slippage_100k / Decimal::ONE_HUNDRED
    };

    // Depth at each configured deviation band; the record carries the
    // widest (labeled) band.
    let (deviations, deviation_label) = deviation_set(&view.symbol);
    let band_depths: Vec<(Decimal, Decimal)> = deviations
        .iter()
        .map(|d| {
            (
                depth_within(&view.bids, mid_price * (Decimal::ONE - d), Side::Bid),
                depth_within(&view.asks, mid_price * (Decimal::ONE + d), Side::Ask),
            )
        })
        .collect();
    let (depth_deviation_bid, depth_deviation_ask) =
        band_depths.last().copied().unwrap_or((Decimal::ZERO, Decimal::ZERO));

    let core = CoreMetricsRecord {
        timestamp_ms,
        spread_percent,
        total_depth,
        bid_depth,
        ask_depth,
        slippage_100k,
        slippage_1m,
        liquidity_score: liquidity_score(total_depth, spread_percent),
        imbalance,
        mid_price,
        best_bid,
        best_ask,
    };

    let advanced = AdvancedMetricsRecord {
        timestamp_ms,
        bid_depth,
        ask_depth,
        impact_cost_avg,
        depth_deviation_bid,
        depth_deviation_ask,
        best_bid,
        best_ask,
        deviation_label: deviation_label.to_string(),
    };

    Some(MetricsBundle {
        core,
        advanced,
        slippage: ladder,
    })
}
