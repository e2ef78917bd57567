//! Depth stream subscriptions
//!
//! One WebSocket connection per single-pair subscription plus one combined
//! connection for all futures pairs.

mod connection;
mod subscriber;

pub use connection::StreamConnection;
pub use subscriber::StreamSubscriber;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

use crate::config::UpdateInterval;
use crate::orderbook::{PairKey, Segment};

/// Maximum substreams one combined connection may carry
pub const MAX_COMBINED_STREAMS: usize = 1024;

/// Build the exchange stream name for a symbol
pub fn stream_name(symbol: &str, segment: Segment, interval: UpdateInterval) -> String {
    let symbol = symbol.to_lowercase();
    match (interval, segment) {
        (UpdateInterval::Ms1000, _) => format!("{symbol}@depth"),
        (UpdateInterval::Ms100, _) => format!("{symbol}@depth@100ms"),
        (UpdateInterval::Ms500, Segment::Futures) => format!("{symbol}@depth@500ms"),
        (UpdateInterval::Ms500, Segment::Spot) => {
            warn!(symbol = %symbol, "500ms interval is futures-only, using default");
            format!("{symbol}@depth")
        }
    }
}

/// Per-key subscription liveness
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    pub is_alive: bool,
    pub last_update_at: DateTime<Utc>,
    pub subscribed_at: DateTime<Utc>,
}

impl SubscriptionStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_alive: false,
            last_update_at: now,
            subscribed_at: now,
        }
    }
}

/// One failed subscription awaiting retry
#[derive(Debug, Clone, Serialize)]
pub struct FailedEntry {
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub reason: String,
}

/// Sliding-window counter for connection admission
#[derive(Debug)]
pub struct AdmissionWindow {
    attempts: VecDeque<DateTime<Utc>>,
    limit: usize,
}

impl AdmissionWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            attempts: VecDeque::new(),
            limit,
        }
    }

    /// Record an attempt if the window has room
    pub fn try_admit(&mut self, now: DateTime<Utc>) -> bool {
        let window_start = now - Duration::seconds(60);
        while let Some(front) = self.attempts.front() {
            if *front < window_start {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= self.limit {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    pub fn recent_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Status row exposed per key
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub key: PairKey,
    pub is_alive: bool,
    pub age_seconds: i64,
    pub subscription_age_seconds: i64,
}

/// Failed-subscription row exposed in the status surface
#[derive(Debug, Clone, Serialize)]
pub struct FailedRow {
    pub key: PairKey,
    #[serde(flatten)]
    pub entry: FailedEntry,
}

/// Aggregate subscription status
#[derive(Debug, Clone, Serialize)]
pub struct OverallStatus {
    pub active_connections: usize,
    pub recent_connection_attempts: usize,
    pub connection_limit: usize,
    pub failed_count: usize,
    pub failed_subscriptions: Vec<FailedRow>,
    pub resyncs_in_progress: Vec<PairKey>,
    pub subscriptions: Vec<StatusRow>,
}
