//! Health supervisor
//!
//! Ticks every 15 seconds and performs at most one remediation of each
//! class per tick: retry a failed subscription, fix a never-alive or
//! stalled key, and re-sync one gap-flagged replica.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::orderbook::{OrderBookStore, PairKey, Segment};
use crate::stream::{StatusRow, StreamSubscriber};

const TICK_SECS: u64 = 15;
/// A subscription this old that never went alive gets recycled
const NEVER_ALIVE_SECS: i64 = 60;
/// An alive subscription without updates for this long is stalled
const STALL_SECS: i64 = 60;

/// First key that subscribed long ago but never produced an applied diff
fn pick_never_alive<'a>(rows: &'a [StatusRow], skip: &[PairKey]) -> Option<&'a StatusRow> {
    rows.iter().find(|r| {
        !r.is_alive && r.subscription_age_seconds > NEVER_ALIVE_SECS && !skip.contains(&r.key)
    })
}

/// First alive key whose last applied diff is too old
fn pick_stalled<'a>(rows: &'a [StatusRow], skip: &[PairKey]) -> Option<&'a StatusRow> {
    rows.iter()
        .find(|r| r.is_alive && r.age_seconds > STALL_SECS && !skip.contains(&r.key))
}

/// Periodic remediation of subscriptions and replicas
pub struct HealthSupervisor {
    config: Arc<Config>,
    subscriber: Arc<StreamSubscriber>,
    store: Arc<RwLock<OrderBookStore>>,
    client: Arc<ExchangeClient>,
}

impl HealthSupervisor {
    pub fn new(
        config: Arc<Config>,
        subscriber: Arc<StreamSubscriber>,
        store: Arc<RwLock<OrderBookStore>>,
        client: Arc<ExchangeClient>,
    ) -> Self {
        Self {
            config,
            subscriber,
            store,
            client,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        self.process_retry_queue().await;

        let resyncing = self.subscriber.resyncs_in_progress().await;
        let statuses = self.subscriber.subscription_statuses().await;

        if let Some(row) = pick_never_alive(&statuses, &resyncing) {
            warn!(key = %row.key, age = row.subscription_age_seconds, "Subscription never went alive, recycling");
            self.resubscribe(row.key.clone()).await;
        }

        let statuses = self.subscriber.subscription_statuses().await;
        if let Some(row) = pick_stalled(&statuses, &resyncing) {
            warn!(key = %row.key, age = row.age_seconds, "Subscription stalled, recycling");
            self.resubscribe(row.key.clone()).await;
        }

        self.process_resyncs().await;
    }

    async fn process_retry_queue(&self) {
        let Some(key) = self.subscriber.next_retry().await else {
            return;
        };
        info!(key = %key, "Retrying failed subscription");

        if key.is_combined() {
            self.subscriber
                .subscribe_futures_combined(&self.config.pairs)
                .await;
        } else {
            self.subscriber.subscribe(&key.symbol, key.segment).await;
        }
    }

    async fn resubscribe(&self, key: PairKey) {
        self.subscriber.unsubscribe(&key).await;
        self.subscriber.subscribe(&key.symbol, key.segment).await;
    }

    async fn process_resyncs(&self) {
        let keys = {
            let store = self.store.read().await;
            store.keys_needing_resync()
        };

        for key in keys {
            if !self.subscriber.begin_resync(&key).await {
                continue;
            }
            self.resync(&key).await;
            self.subscriber.finish_resync(&key).await;
            break;
        }
    }

    /// Fetch a fresh snapshot and replace the flagged replica. The fetch
    /// happens first so a failed fetch leaves the flag set for the next
    /// tick rather than losing the replica.
    async fn resync(&self, key: &PairKey) {
        info!(key = %key, "Re-syncing replica");
        let snapshot = match key.segment {
            Segment::Spot => self.client.fetch_spot_depth(&key.symbol).await.map(Some),
            Segment::Futures => self.client.fetch_futures_depth(&key.symbol).await,
        };

        match snapshot {
            Ok(Some(snapshot)) => {
                let mut store = self.store.write().await;
                store.clear(key);
                store.initialize(key.clone(), &snapshot);
                info!(key = %key, last_update_id = snapshot.last_update_id, "Replica re-initialized");
            }
            Ok(None) => {
                warn!(key = %key, "No instrument for flagged replica, dropping it");
                self.store.write().await.clear(key);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Re-sync snapshot failed, will retry next tick");
            }
        }
    }
}
