//! Metrics engine
//!
//! Subscribes to replica updates, coalesces bursts per key, computes both
//! metric classes and persists them at a throttled cadence.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::compute::compute_bundle;
use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::orderbook::{OrderBookStore, PairKey};
use crate::timeseries::TimeSeriesStore;

/// Burst coalescing window per key
const DEBOUNCE_MS: u64 = 100;

/// Cadence gate: at most one write per key per interval
struct WriteGate {
    interval_ms: i64,
    last_written: HashMap<PairKey, i64>,
}

impl WriteGate {
    fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_written: HashMap::new(),
        }
    }

    fn should_write(&mut self, key: &PairKey, now_ms: i64) -> bool {
        match self.last_written.get(key) {
            Some(last) if now_ms - last < self.interval_ms => false,
            _ => {
                self.last_written.insert(key.clone(), now_ms);
                true
            }
        }
    }
}

/// Computes liquidity metrics on replica updates
pub struct MetricsEngine {
    store: Arc<RwLock<OrderBookStore>>,
    timeseries: Arc<TimeSeriesStore>,
    bus: EventBus,
    core_gate: WriteGate,
    advanced_gate: WriteGate,
}

impl MetricsEngine {
    pub fn new(
        store: Arc<RwLock<OrderBookStore>>,
        timeseries: Arc<TimeSeriesStore>,
        bus: EventBus,
        config: &Config,
    ) -> Self {
        Self {
            store,
            timeseries,
            bus,
            core_gate: WriteGate::new(config.core_save_interval_ms),
            advanced_gate: WriteGate::new(config.advanced_save_interval_ms),
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&mut self) {
        let mut rx = self.bus.subscribe();
        let mut dirty: HashSet<PairKey> = HashSet::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(DEBOUNCE_MS));

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(BusEvent::ReplicaUpdated { key }) => {
                        dirty.insert(key);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Metrics engine lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    for key in dirty.drain() {
                        self.process(key).await;
                    }
                }
            }
        }
    }

    async fn process(&mut self, key: PairKey) {
        // The store read already enforces the resync and zombie guards.
        let view = {
            let store = self.store.read().await;
            store.get(&key)
        };
        let Some(view) = view else {
            debug!(key = %key, "Replica not readable, skipping metrics");
            return;
        };

        let now_ms = Utc::now().timestamp_millis();
        let Some(bundle) = compute_bundle(&view, now_ms) else {
            return;
        };

        self.bus.publish(BusEvent::MetricsComputed {
            key: key.clone(),
            timestamp_ms: now_ms,
        });

        if self.core_gate.should_write(&key, now_ms) {
            let timeseries = self.timeseries.clone();
            let write_key = key.clone();
            let record = bundle.core.clone();
            tokio::spawn(async move {
                timeseries.append_core(&write_key, record).await;
            });
        }
        if self.advanced_gate.should_write(&key, now_ms) {
            let timeseries = self.timeseries.clone();
            let write_key = key.clone();
            let record = bundle.advanced.clone();
            tokio::spawn(async move {
                timeseries.append_advanced(&write_key, record).await;
            });
        }
    }
}
