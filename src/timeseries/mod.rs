//! Time-series persistence for computed metrics
//!
//! Append-only, time-indexed series keyed by (metric class, segment,
//! symbol). Records older than 30 days are pruned; a series idle for more
//! than 31 days expires entirely.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::metrics::{AdvancedMetricsRecord, CoreMetricsRecord};
use crate::orderbook::{PairKey, Segment};

const RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;
const IDLE_TTL_MS: i64 = 31 * 24 * 3600 * 1000;

#[derive(Debug)]
struct Series<T> {
    records: BTreeMap<i64, T>,
    last_write_ms: i64,
}

impl<T> Series<T> {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            last_write_ms: 0,
        }
    }

    fn append(&mut self, timestamp_ms: i64, record: T) {
        self.records.insert(timestamp_ms, record);
        self.last_write_ms = self.last_write_ms.max(timestamp_ms);
        let cutoff = timestamp_ms - RETENTION_MS;
        self.records = self.records.split_off(&cutoff);
    }

    fn range(&self, start_ms: Option<i64>, end_ms: Option<i64>, limit: usize) -> Vec<&T> {
        let start = start_ms.unwrap_or(i64::MIN);
        let end = end_ms.unwrap_or(i64::MAX);
        self.records
            .range(start..=end)
            .map(|(_, r)| r)
            .take(limit)
            .collect()
    }

    fn recent(&self, count: usize) -> Vec<&T> {
        let mut out: Vec<&T> = self.records.values().rev().take(count).collect();
        out.reverse();
        out
    }
}

/// Count and time bounds for one key
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub core_count: usize,
    pub advanced_count: usize,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

/// Latest records for one key
#[derive(Debug, Clone, Serialize)]
pub struct RecentMetrics {
    pub core: Vec<CoreMetricsRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced: Option<Vec<AdvancedMetricsRecord>>,
}

type SeriesId = (Segment, String);

/// In-memory time-series store for both metric classes
pub struct TimeSeriesStore {
    core: RwLock<HashMap<SeriesId, Series<CoreMetricsRecord>>>,
    advanced: RwLock<HashMap<SeriesId, Series<AdvancedMetricsRecord>>>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(HashMap::new()),
            advanced: RwLock::new(HashMap::new()),
        }
    }

    fn id(key: &PairKey) -> SeriesId {
        (key.segment, key.symbol.clone())
    }

    pub async fn append_core(&self, key: &PairKey, record: CoreMetricsRecord) {
        let mut series = self.core.write().await;
        series
            .entry(Self::id(key))
            .or_insert_with(Series::new)
            .append(record.timestamp_ms, record);
    }

    pub async fn append_advanced(&self, key: &PairKey, record: AdvancedMetricsRecord) {
        let mut series = self.advanced.write().await;
        series
            .entry(Self::id(key))
            .or_insert_with(Series::new)
            .append(record.timestamp_ms, record);
    }

    /// Core records in `[start_ms, end_ms]`, time ascending
    pub async fn range_core(
        &self,
        key: &PairKey,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Vec<CoreMetricsRecord> {
        let series = self.core.read().await;
        series
            .get(&Self::id(key))
            .map(|s| s.range(start_ms, end_ms, limit).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn range_advanced(
        &self,
        key: &PairKey,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Vec<AdvancedMetricsRecord> {
        let series = self.advanced.read().await;
        series
            .get(&Self::id(key))
            .map(|s| s.range(start_ms, end_ms, limit).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The latest `count` records, optionally including the advanced class
    pub async fn recent(
        &self,
        key: &PairKey,
        count: usize,
        include_advanced: bool,
    ) -> RecentMetrics {
        let core = {
            let series = self.core.read().await;
            series
                .get(&Self::id(key))
                .map(|s| s.recent(count).into_iter().cloned().collect())
                .unwrap_or_default()
        };
        let advanced = if include_advanced {
            let series = self.advanced.read().await;
            Some(
                series
                    .get(&Self::id(key))
                    .map(|s| s.recent(count).into_iter().cloned().collect())
                    .unwrap_or_default(),
            )
        } else {
            None
        };
        RecentMetrics { core, advanced }
    }

    pub async fn stats(&self, key: &PairKey) -> SeriesStats {
        let id = Self::id(key);
        let core = self.core.read().await;
        let advanced = self.advanced.read().await;

        let core_series = core.get(&id);
        let core_count = core_series.map(|s| s.records.len()).unwrap_or(0);
        let advanced_count = advanced.get(&id).map(|s| s.records.len()).unwrap_or(0);
        let start_ms = core_series.and_then(|s| s.records.keys().next().copied());
        let end_ms = core_series.and_then(|s| s.records.keys().next_back().copied());

        SeriesStats {
            core_count,
            advanced_count,
            start_ms,
            end_ms,
        }
    }

    /// Drop expired records and idle series. Called periodically.
    pub async fn sweep(&self) {
        let now_ms = Utc::now().timestamp_millis();
        self.sweep_at(now_ms).await;
    }

    async fn sweep_at(&self, now_ms: i64) {
        let cutoff = now_ms - RETENTION_MS;
        let idle_cutoff = now_ms - IDLE_TTL_MS;

        let mut core = self.core.write().await;
        core.retain(|_, s| s.last_write_ms >= idle_cutoff);
        for series in core.values_mut() {
            series.records = series.records.split_off(&cutoff);
        }
        drop(core);

        let mut advanced = self.advanced.write().await;
        advanced.retain(|_, s| s.last_write_ms >= idle_cutoff);
        for series in advanced.values_mut() {
            series.records = series.records.split_off(&cutoff);
        }
    }
}

impl Default for TimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn core_record(timestamp_ms: i64) -> CoreMetricsRecord {
        CoreMetricsRecord {
            timestamp_ms,
            spread_percent: dec!(0.01),
            total_depth: dec!(1000000),
            bid_depth: dec!(500000),
            ask_depth: dec!(500000),
            slippage_100k: dec!(0.02),
            slippage_1m: dec!(0.2),
            liquidity_score: 95,
            imbalance: dec!(0),
            mid_price: dec!(50000),
            best_bid: dec!(49999),
            best_ask: dec!(50001),
        }
    }

    fn advanced_record(timestamp_ms: i64) -> AdvancedMetricsRecord {
        AdvancedMetricsRecord {
            timestamp_ms,
            bid_depth: dec!(500000),
            ask_depth: dec!(500000),
            impact_cost_avg: dec!(0.0002),
            depth_deviation_bid: dec!(800000),
            depth_deviation_ask: dec!(700000),
            best_bid: dec!(49999),
            best_ask: dec!(50001),
            deviation_label: "0.10%".to_string(),
        }
    }

    fn key() -> PairKey {
        PairKey::spot("BTCUSDT")
    }

    #[tokio::test]
    async fn range_is_time_ascending_and_bounded() {
        let store = TimeSeriesStore::new();
        for ts in [3000, 1000, 2000, 4000] {
            store.append_core(&key(), core_record(ts)).await;
        }

        let rows = store.range_core(&key(), Some(1000), Some(3000), 10).await;
        let times: Vec<i64> = rows.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);

        let limited = store.range_core(&key(), None, None, 2).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].timestamp_ms, 1000);
    }

    #[tokio::test]
    async fn recent_returns_latest_in_ascending_order() {
        let store = TimeSeriesStore::new();
        for ts in [1000, 2000, 3000] {
            store.append_core(&key(), core_record(ts)).await;
            store.append_advanced(&key(), advanced_record(ts)).await;
        }

        let recent = store.recent(&key(), 2, true).await;
        let times: Vec<i64> = recent.core.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![2000, 3000]);
        assert_eq!(recent.advanced.unwrap().len(), 2);

        let without = store.recent(&key(), 2, false).await;
        assert!(without.advanced.is_none());
    }

    #[tokio::test]
    async fn stats_report_counts_and_bounds() {
        let store = TimeSeriesStore::new();
        store.append_core(&key(), core_record(1000)).await;
        store.append_core(&key(), core_record(5000)).await;
        store.append_advanced(&key(), advanced_record(1000)).await;

        let stats = store.stats(&key()).await;
        assert_eq!(stats.core_count, 2);
        assert_eq!(stats.advanced_count, 1);
        assert_eq!(stats.start_ms, Some(1000));
        assert_eq!(stats.end_ms, Some(5000));
    }

    #[tokio::test]
    async fn append_prunes_past_retention() {
        let store = TimeSeriesStore::new();
        let now = 100 * 24 * 3600 * 1000i64;
        store.append_core(&key(), core_record(now - RETENTION_MS - 1000)).await;
        store.append_core(&key(), core_record(now)).await;

        let rows = store.range_core(&key(), None, None, 10).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ms, now);
    }

    #[tokio::test]
    async fn sweep_expires_idle_series() {
        let store = TimeSeriesStore::new();
        let old = 1000i64;
        store.append_core(&key(), core_record(old)).await;

        store.sweep_at(old + IDLE_TTL_MS + 1000).await;
        let stats = store.stats(&key()).await;
        assert_eq!(stats.core_count, 0);
    }

    #[tokio::test]
    async fn series_are_isolated_per_segment() {
        let store = TimeSeriesStore::new();
        store.append_core(&PairKey::spot("BTCUSDT"), core_record(1000)).await;
        store
            .append_core(&PairKey::futures("BTCUSDT"), core_record(2000))
            .await;

        let spot = store.range_core(&PairKey::spot("BTCUSDT"), None, None, 10).await;
        let futures = store
            .range_core(&PairKey::futures("BTCUSDT"), None, None, 10)
            .await;
        assert_eq!(spot.len(), 1);
        assert_eq!(futures.len(), 1);
        assert_eq!(spot[0].timestamp_ms, 1000);
        assert_eq!(futures[0].timestamp_ms, 2000);
    }
}
