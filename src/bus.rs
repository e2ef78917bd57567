//! In-process event bus
//!
//! Fan-out of replica and metrics events over a bounded broadcast channel.
//! A slow subscriber lags and drops the oldest events instead of
//! back-pressuring the stream readers.

use tokio::sync::broadcast;

use crate::orderbook::PairKey;

const BUS_CAPACITY: usize = 1024;

/// Events published by the subscription and metrics paths
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A depth diff was applied to the replica for `key`
    ReplicaUpdated { key: PairKey },
    /// A metrics computation finished for `key`
    MetricsComputed { key: PairKey, timestamp_ms: i64 },
    /// A stream-level failure was observed
    StreamError { key: PairKey, reason: String },
}

/// Bounded in-process publish/subscribe
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
