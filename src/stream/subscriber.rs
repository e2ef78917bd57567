//! Stream subscription supervision
//!
//! Owns every stream connection, the retry queue, the admission window and
//! the per-key subscription status. Initialization follows the exchange
//! protocol: buffer diffs while the REST snapshot is in flight, then drain
//! the buffer gap-safe and apply live from there.

use chrono::Utc;
use prometheus::IntGauge;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    stream_name, AdmissionWindow, FailedEntry, FailedRow, OverallStatus, StatusRow,
    StreamConnection, SubscriptionStatus, MAX_COMBINED_STREAMS,
};
use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::error::MonitorError;
use crate::exchange::ExchangeClient;
use crate::orderbook::{ApplyOutcome, OrderBookStore, PairKey, Segment};
use crate::parser::{DepthDiff, DepthSnapshot, ParsedMessage, StreamEnvelope};

/// Deadline for a subscription to produce a readable replica
const INIT_DEADLINE_SECS: u64 = 30;
/// Poll step while waiting for initialization
const INIT_POLL_MS: u64 = 250;
/// Spacing between REST snapshots during combined-stream init
const COMBINED_SNAPSHOT_SPACING_MS: u64 = 500;

struct ConnectionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    fn close(&self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Decrements the active-connection gauge when the reader task ends,
/// including on abort.
struct ActiveGuard(IntGauge);

impl ActiveGuard {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// State shared between subscribe calls, reader tasks and the supervisor
struct Shared {
    connections: HashMap<PairKey, ConnectionHandle>,
    statuses: HashMap<PairKey, SubscriptionStatus>,
    failed: HashMap<PairKey, FailedEntry>,
    admission: AdmissionWindow,
    resyncs_in_flight: HashSet<PairKey>,
}

/// Everything a reader task needs
#[derive(Clone)]
struct Ctx {
    config: Arc<Config>,
    client: Arc<ExchangeClient>,
    store: Arc<RwLock<OrderBookStore>>,
    bus: EventBus,
    shared: Arc<Mutex<Shared>>,
    active: IntGauge,
}

/// Manages all depth stream subscriptions
pub struct StreamSubscriber {
    ctx: Ctx,
}

impl StreamSubscriber {
    pub fn new(
        config: Arc<Config>,
        client: Arc<ExchangeClient>,
        store: Arc<RwLock<OrderBookStore>>,
        bus: EventBus,
    ) -> Self {
        let active = IntGauge::new("stream_connections_active", "Open stream connections")
            .expect("valid metric name");
        let _ = prometheus::default_registry().register(Box::new(active.clone()));

        let shared = Shared {
            connections: HashMap::new(),
            statuses: HashMap::new(),
            failed: HashMap::new(),
            admission: AdmissionWindow::new(config.max_connections_per_minute),
            resyncs_in_flight: HashSet::new(),
        };

        Self {
            ctx: Ctx {
                config,
                client,
                store,
                bus,
                shared: Arc::new(Mutex::new(shared)),
                active,
            },
        }
    }

    /// Subscribe a single pair. Returns true once the replica is readable.
    pub async fn subscribe(&self, symbol: &str, segment: Segment) -> bool {
        let key = PairKey::new(symbol.to_uppercase(), segment);

        {
            let mut guard = self.ctx.shared.lock().await;
            let shared = &mut *guard;
            if !shared.admission.try_admit(Utc::now()) {
                warn!(key = %key, "Connection attempt limit reached");
                enqueue_failure(shared, &key, "connection rate limit");
                return false;
            }
            if let Some(handle) = shared.connections.remove(&key) {
                handle.close();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_single(self.ctx.clone(), key.clone(), shutdown_rx));
        self.ctx.shared.lock().await.connections.insert(
            key.clone(),
            ConnectionHandle {
                shutdown: shutdown_tx,
                task,
            },
        );

        if self.wait_until_readable(std::slice::from_ref(&key)).await {
            return true;
        }

        warn!(key = %key, "Subscription not readable within deadline");
        let mut guard = self.ctx.shared.lock().await;
        enqueue_failure(&mut guard, &key, "init timeout");
        false
    }

    /// Subscribe all futures pairs over one combined stream. Readiness means
    /// at least one symbol has a readable replica.
    pub async fn subscribe_futures_combined(&self, symbols: &[String]) -> bool {
        let key = PairKey::combined_futures();
        let symbols: Vec<String> = symbols
            .iter()
            .take(MAX_COMBINED_STREAMS)
            .map(|s| s.to_uppercase())
            .collect();
        if symbols.is_empty() {
            return false;
        }

        {
            let mut guard = self.ctx.shared.lock().await;
            let shared = &mut *guard;
            if !shared.admission.try_admit(Utc::now()) {
                warn!("Connection attempt limit reached for combined stream");
                enqueue_failure(shared, &key, "connection rate limit");
                return false;
            }
            if let Some(handle) = shared.connections.remove(&key) {
                handle.close();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_combined(
            self.ctx.clone(),
            symbols.clone(),
            shutdown_rx,
        ));
        self.ctx.shared.lock().await.connections.insert(
            key.clone(),
            ConnectionHandle {
                shutdown: shutdown_tx,
                task,
            },
        );

        let keys: Vec<PairKey> = symbols
            .iter()
            .map(|s| PairKey::futures(s.as_str()))
            .collect();
        if self.wait_until_readable(&keys).await {
            return true;
        }

        warn!("Combined futures stream produced no readable replica within deadline");
        let mut guard = self.ctx.shared.lock().await;
        enqueue_failure(&mut guard, &key, "init timeout");
        false
    }

    async fn wait_until_readable(&self, keys: &[PairKey]) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(INIT_DEADLINE_SECS);
        while tokio::time::Instant::now() < deadline {
            {
                let store = self.ctx.store.read().await;
                if keys.iter().any(|k| store.get(k).is_some()) {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(INIT_POLL_MS)).await;
        }
        false
    }

    /// Close the connection for a key and drop its status
    pub async fn unsubscribe(&self, key: &PairKey) {
        let mut guard = self.ctx.shared.lock().await;
        if let Some(handle) = guard.connections.remove(key) {
            handle.close();
        }
        guard.statuses.remove(key);
        info!(key = %key, "Unsubscribed");
    }

    /// Close every open connection
    pub async fn shutdown_all(&self) {
        let mut guard = self.ctx.shared.lock().await;
        for (key, handle) in guard.connections.drain() {
            debug!(key = %key, "Closing stream");
            handle.close();
        }
    }

    /// Oldest retry-queue entry whose last attempt is at least
    /// `reconnect_delay_ms` ago. Marks the attempt.
    pub async fn next_retry(&self) -> Option<PairKey> {
        let delay = chrono::Duration::milliseconds(self.ctx.config.reconnect_delay_ms as i64);
        let now = Utc::now();
        let mut guard = self.ctx.shared.lock().await;

        let key = guard
            .failed
            .iter()
            .filter(|(_, e)| e.last_retry_at.map_or(true, |t| now - t >= delay))
            .min_by_key(|(_, e)| e.first_failed_at)
            .map(|(k, _)| k.clone())?;

        if let Some(entry) = guard.failed.get_mut(&key) {
            entry.retry_count += 1;
            entry.last_retry_at = Some(now);
        }
        Some(key)
    }

    /// Claim the resync slot for a key. False if one is already running.
    pub async fn begin_resync(&self, key: &PairKey) -> bool {
        self.ctx
            .shared
            .lock()
            .await
            .resyncs_in_flight
            .insert(key.clone())
    }

    pub async fn finish_resync(&self, key: &PairKey) {
        self.ctx.shared.lock().await.resyncs_in_flight.remove(key);
    }

    pub async fn resyncs_in_progress(&self) -> Vec<PairKey> {
        self.ctx
            .shared
            .lock()
            .await
            .resyncs_in_flight
            .iter()
            .cloned()
            .collect()
    }

    pub async fn failed_subscriptions(&self) -> Vec<FailedRow> {
        let guard = self.ctx.shared.lock().await;
        let mut rows: Vec<FailedRow> = guard
            .failed
            .iter()
            .map(|(key, entry)| FailedRow {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect();
        rows.sort_by_key(|r| r.entry.first_failed_at);
        rows
    }

    pub async fn subscription_statuses(&self) -> Vec<StatusRow> {
        let now = Utc::now();
        let guard = self.ctx.shared.lock().await;
        let mut rows: Vec<StatusRow> = guard
            .statuses
            .iter()
            .map(|(key, status)| StatusRow {
                key: key.clone(),
                is_alive: status.is_alive,
                age_seconds: (now - status.last_update_at).num_seconds(),
                subscription_age_seconds: (now - status.subscribed_at).num_seconds(),
            })
            .collect();
        rows.sort_by(|a, b| a.key.symbol.cmp(&b.key.symbol));
        rows
    }

    pub async fn overall_status(&self) -> OverallStatus {
        let failed_subscriptions = self.failed_subscriptions().await;
        let subscriptions = self.subscription_statuses().await;
        let guard = self.ctx.shared.lock().await;
        OverallStatus {
            active_connections: self.ctx.active.get().max(0) as usize,
            recent_connection_attempts: guard.admission.recent_attempts(),
            connection_limit: guard.admission.limit(),
            failed_count: failed_subscriptions.len(),
            failed_subscriptions,
            resyncs_in_progress: guard.resyncs_in_flight.iter().cloned().collect(),
            subscriptions,
        }
    }
}

fn enqueue_failure(shared: &mut Shared, key: &PairKey, reason: &str) {
    let now = Utc::now();
    shared
        .failed
        .entry(key.clone())
        .and_modify(|e| e.reason = reason.to_string())
        .or_insert_with(|| FailedEntry {
            retry_count: 0,
            first_failed_at: now,
            last_retry_at: None,
            reason: reason.to_string(),
        });
}

/// Mark a key dead and enqueue it for the supervisor
async fn note_failure(ctx: &Ctx, key: &PairKey, reason: &str) {
    {
        let mut guard = ctx.shared.lock().await;
        let shared = &mut *guard;
        if let Some(status) = shared.statuses.get_mut(key) {
            status.is_alive = false;
        }
        enqueue_failure(shared, key, reason);
    }
    ctx.bus.publish(BusEvent::StreamError {
        key: key.clone(),
        reason: reason.to_string(),
    });
}

async fn fetch_snapshot(
    ctx: &Ctx,
    key: &PairKey,
) -> crate::error::Result<Option<DepthSnapshot>> {
    match key.segment {
        Segment::Spot => ctx.client.fetch_spot_depth(&key.symbol).await.map(Some),
        Segment::Futures => ctx.client.fetch_futures_depth(&key.symbol).await,
    }
}

fn snapshot_failure_reason(err: &MonitorError) -> &'static str {
    match err {
        MonitorError::RateLimited { .. } | MonitorError::Banned => "rate-limited snapshot",
        _ => "snapshot http error",
    }
}

/// Apply one diff and maintain the liveness bookkeeping
async fn apply_diff(ctx: &Ctx, key: &PairKey, diff: &DepthDiff) -> (ApplyOutcome, bool) {
    let outcome = ctx.store.write().await.apply_diff(key, diff);
    let mut became_alive = false;

    match outcome {
        ApplyOutcome::Applied => {
            {
                let mut guard = ctx.shared.lock().await;
                let shared = &mut *guard;
                let now = Utc::now();
                if let Some(status) = shared.statuses.get_mut(key) {
                    status.last_update_at = now;
                    if !status.is_alive {
                        status.is_alive = true;
                        became_alive = true;
                    }
                }
                if became_alive {
                    shared.failed.remove(key);
                    info!(key = %key, "Subscription alive");
                }
            }
            ctx.bus.publish(BusEvent::ReplicaUpdated { key: key.clone() });
        }
        ApplyOutcome::Gap => {
            // The supervisor picks the resync flag up from the store.
            ctx.bus.publish(BusEvent::StreamError {
                key: key.clone(),
                reason: "update gap".to_string(),
            });
        }
        _ => {}
    }

    (outcome, became_alive)
}

/// Replay diffs buffered while the snapshot was in flight. Diffs entirely
/// covered by the snapshot are discarded.
async fn drain_buffer(ctx: &Ctx, key: &PairKey, snapshot_id: u64, buffer: Vec<DepthDiff>) {
    for diff in buffer {
        if diff.final_update_id <= snapshot_id {
            continue;
        }
        apply_diff(ctx, key, &diff).await;
    }
}

/// Reader task for a single-pair subscription
async fn run_single(ctx: Ctx, key: PairKey, mut shutdown: watch::Receiver<bool>) {
    let endpoint = match key.segment {
        Segment::Spot => &ctx.config.spot_ws_endpoint,
        Segment::Futures => &ctx.config.futures_ws_endpoint,
    };
    let name = stream_name(&key.symbol, key.segment, ctx.config.update_interval);
    let url = format!("{}/ws/{}", endpoint, name);

    let mut conn = StreamConnection::new(url);
    if let Err(e) = conn.connect().await {
        error!(key = %key, error = %e, "Stream connect failed");
        note_failure(&ctx, &key, &format!("ws transport error: {e}")).await;
        return;
    }

    let _active = ActiveGuard::new(ctx.active.clone());
    ctx.shared
        .lock()
        .await
        .statuses
        .insert(key.clone(), SubscriptionStatus::new(Utc::now()));

    let mut buffer: Vec<DepthDiff> = Vec::new();
    let mut snapshot_ready = false;
    let mut snapshot_pending = true;
    let snapshot_fut = fetch_snapshot(&ctx, &key);
    tokio::pin!(snapshot_fut);

    let ping_interval = Duration::from_millis(ctx.config.ping_interval_ms);
    let mut last_ping = tokio::time::Instant::now();

    loop {
        if last_ping.elapsed() >= ping_interval {
            if let Err(e) = conn.ping().await {
                warn!(key = %key, error = %e, "Keep-alive ping failed");
                note_failure(&ctx, &key, "ws transport error").await;
                return;
            }
            last_ping = tokio::time::Instant::now();
        }

        tokio::select! {
            _ = shutdown.changed() => {
                conn.close().await;
                return;
            }
            snapshot = &mut snapshot_fut, if snapshot_pending => {
                snapshot_pending = false;
                match snapshot {
                    Ok(Some(snap)) => {
                        ctx.store.write().await.initialize(key.clone(), &snap);
                        info!(key = %key, last_update_id = snap.last_update_id, "Replica initialized");
                        drain_buffer(&ctx, &key, snap.last_update_id, std::mem::take(&mut buffer)).await;
                        snapshot_ready = true;
                    }
                    Ok(None) => {
                        warn!(key = %key, "No instrument for symbol, closing stream");
                        note_failure(&ctx, &key, "no instrument").await;
                        conn.close().await;
                        return;
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "Snapshot fetch failed");
                        note_failure(&ctx, &key, snapshot_failure_reason(&e)).await;
                        conn.close().await;
                        return;
                    }
                }
            }
            message = timeout(ping_interval, conn.next_text()) => match message {
                Ok(Ok(text)) => {
                    match ParsedMessage::parse(&text) {
                        Ok(ParsedMessage::DepthDiff(diff)) => {
                            if !snapshot_ready {
                                buffer.push(diff);
                            } else {
                                apply_diff(&ctx, &key, &diff).await;
                            }
                        }
                        Ok(ParsedMessage::Unknown(msg)) => {
                            debug!(key = %key, msg = %msg, "Unknown message type");
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to parse message");
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Stream closed");
                    note_failure(&ctx, &key, &format!("stream closed: {e}")).await;
                    return;
                }
                // No traffic inside a full ping interval; loop to keep-alive.
                Err(_) => {}
            }
        }
    }
}

/// Reader task for the combined futures stream
async fn run_combined(ctx: Ctx, symbols: Vec<String>, mut shutdown: watch::Receiver<bool>) {
    let combined_key = PairKey::combined_futures();
    let names: Vec<String> = symbols
        .iter()
        .map(|s| stream_name(s, Segment::Futures, ctx.config.update_interval))
        .collect();
    let url = format!(
        "{}/stream?streams={}",
        ctx.config.futures_ws_endpoint,
        names.join("/")
    );

    let mut conn = StreamConnection::new(url);
    if let Err(e) = conn.connect().await {
        error!(error = %e, "Combined stream connect failed");
        note_failure(&ctx, &combined_key, &format!("ws transport error: {e}")).await;
        return;
    }

    let _active = ActiveGuard::new(ctx.active.clone());
    {
        let now = Utc::now();
        let mut guard = ctx.shared.lock().await;
        for symbol in &symbols {
            guard
                .statuses
                .insert(PairKey::futures(symbol.as_str()), SubscriptionStatus::new(now));
        }
    }

    // Snapshots are fetched sequentially while the read loop is already
    // consuming; diffs for a symbol count only once it is initialized.
    let initialized: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let init_task = {
        let ctx = ctx.clone();
        let symbols = symbols.clone();
        let initialized = initialized.clone();
        tokio::spawn(async move {
            for symbol in symbols {
                match ctx.client.fetch_futures_depth(&symbol).await {
                    Ok(Some(snapshot)) => {
                        let key = PairKey::futures(symbol.as_str());
                        ctx.store.write().await.initialize(key.clone(), &snapshot);
                        initialized.lock().await.insert(symbol.clone());
                        info!(key = %key, last_update_id = snapshot.last_update_id, "Replica initialized");
                    }
                    Ok(None) => {
                        warn!(symbol = %symbol, "No futures instrument, skipping");
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Futures snapshot failed");
                    }
                }
                tokio::time::sleep(Duration::from_millis(COMBINED_SNAPSHOT_SPACING_MS)).await;
            }
        })
    };

    let ping_interval = Duration::from_millis(ctx.config.ping_interval_ms);
    let mut last_ping = tokio::time::Instant::now();

    loop {
        if last_ping.elapsed() >= ping_interval {
            if let Err(e) = conn.ping().await {
                warn!(error = %e, "Combined keep-alive ping failed");
                init_task.abort();
                mark_symbols_dead(&ctx, &symbols).await;
                note_failure(&ctx, &combined_key, "ws transport error").await;
                return;
            }
            last_ping = tokio::time::Instant::now();
        }

        tokio::select! {
            _ = shutdown.changed() => {
                conn.close().await;
                init_task.abort();
                mark_symbols_dead(&ctx, &symbols).await;
                return;
            }
            message = timeout(ping_interval, conn.next_text()) => match message {
                Ok(Ok(text)) => {
                    let Ok(envelope) = serde_json::from_str::<StreamEnvelope>(&text) else {
                        debug!("Non-envelope message on combined stream");
                        continue;
                    };
                    let Some(symbol) = envelope.symbol() else { continue };
                    if !initialized.lock().await.contains(&symbol) {
                        continue;
                    }
                    match serde_json::from_value::<DepthDiff>(envelope.data) {
                        Ok(diff) => {
                            let key = PairKey::futures(symbol.as_str());
                            let (_, became_alive) = apply_diff(&ctx, &key, &diff).await;
                            if became_alive {
                                ctx.shared.lock().await.failed.remove(&combined_key);
                            }
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "Failed to parse combined diff");
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Combined stream closed");
                    init_task.abort();
                    mark_symbols_dead(&ctx, &symbols).await;
                    note_failure(&ctx, &combined_key, &format!("stream closed: {e}")).await;
                    return;
                }
                Err(_) => {}
            }
        }
    }
}

/// A combined-stream close takes every symbol with it
async fn mark_symbols_dead(ctx: &Ctx, symbols: &[String]) {
    let mut guard = ctx.shared.lock().await;
    for symbol in symbols {
        if let Some(status) = guard.statuses.get_mut(&PairKey::futures(symbol.as_str())) {
            status.is_alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PriceLevel;
    use rust_decimal_macros::dec;

    fn test_ctx() -> Ctx {
        let config = Arc::new(Config::default());
        let client = Arc::new(ExchangeClient::new(&config).unwrap());
        Ctx {
            config: config.clone(),
            client,
            store: Arc::new(RwLock::new(OrderBookStore::new())),
            bus: EventBus::new(),
            shared: Arc::new(Mutex::new(Shared {
                connections: HashMap::new(),
                statuses: HashMap::new(),
                failed: HashMap::new(),
                admission: AdmissionWindow::new(config.max_connections_per_minute),
                resyncs_in_flight: HashSet::new(),
            })),
            active: IntGauge::new("test_active", "test").unwrap(),
        }
    }

    fn insert_status(shared: &mut Shared, key: &PairKey) {
        shared
            .statuses
            .insert(key.clone(), SubscriptionStatus::new(Utc::now()));
    }

    fn diff(first: u64, last: u64, bids: Vec<PriceLevel>) -> DepthDiff {
        DepthDiff {
            event_type: "depthUpdate".to_string(),
            event_time: 0,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: None,
            bids,
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: vec![PriceLevel {
                price: dec!(10),
                quantity: dec!(1),
            }],
            asks: vec![PriceLevel {
                price: dec!(11),
                quantity: dec!(1),
            }],
        }
    }

    #[tokio::test]
    async fn drain_discards_covered_diffs_and_flips_alive() {
        let ctx = test_ctx();
        let key = PairKey::spot("BTCUSDT");

        {
            let mut guard = ctx.shared.lock().await;
            let shared = &mut *guard;
            insert_status(shared, &key);
            enqueue_failure(shared, &key, "stream closed: test");
        }
        ctx.store.write().await.initialize(key.clone(), &snapshot(55));

        let buffered = vec![
            diff(
                45,
                50,
                vec![PriceLevel {
                    price: dec!(10),
                    quantity: dec!(9),
                }],
            ),
            diff(
                51,
                60,
                vec![PriceLevel {
                    price: dec!(10),
                    quantity: dec!(2),
                }],
            ),
        ];
        drain_buffer(&ctx, &key, 55, buffered).await;

        let store = ctx.store.read().await;
        assert_eq!(store.last_update_id(&key), Some(60));
        let view = store.get(&key).unwrap();
        // The covered diff (u=50) was discarded; only the second applied.
        assert_eq!(view.bids[0].quantity, dec!(2));
        drop(store);

        let guard = ctx.shared.lock().await;
        assert!(guard.statuses.get(&key).unwrap().is_alive);
        // First apply clears the retry entry.
        assert!(guard.failed.is_empty());
    }

    #[tokio::test]
    async fn stale_buffered_diff_does_not_flip_alive() {
        let ctx = test_ctx();
        let key = PairKey::spot("BTCUSDT");
        {
            let mut guard = ctx.shared.lock().await;
            insert_status(&mut guard, &key);
        }
        ctx.store.write().await.initialize(key.clone(), &snapshot(55));

        drain_buffer(&ctx, &key, 55, vec![diff(45, 50, vec![])]).await;

        let guard = ctx.shared.lock().await;
        assert!(!guard.statuses.get(&key).unwrap().is_alive);
    }

    #[tokio::test]
    async fn gap_during_apply_publishes_stream_error() {
        let ctx = test_ctx();
        let key = PairKey::spot("BTCUSDT");
        let mut rx = ctx.bus.subscribe();
        ctx.store.write().await.initialize(key.clone(), &snapshot(55));

        let (outcome, _) = apply_diff(&ctx, &key, &diff(100, 110, vec![])).await;
        assert_eq!(outcome, ApplyOutcome::Gap);

        match rx.recv().await.unwrap() {
            BusEvent::StreamError { key: k, .. } => assert_eq!(k, key),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            ctx.store.read().await.keys_needing_resync(),
            vec![key.clone()]
        );
    }

    #[tokio::test]
    async fn retry_queue_is_oldest_ready_first() {
        let ctx = test_ctx();
        let subscriber = StreamSubscriber { ctx: ctx.clone() };
        let older = PairKey::spot("AAAUSDT");
        let newer = PairKey::spot("BBBUSDT");

        {
            let mut guard = ctx.shared.lock().await;
            let shared = &mut *guard;
            enqueue_failure(shared, &newer, "stream closed: test");
            shared.failed.get_mut(&newer).unwrap().first_failed_at =
                Utc::now() - chrono::Duration::seconds(5);
            enqueue_failure(shared, &older, "stream closed: test");
            shared.failed.get_mut(&older).unwrap().first_failed_at =
                Utc::now() - chrono::Duration::seconds(50);
        }

        assert_eq!(subscriber.next_retry().await, Some(older.clone()));
        // The claimed entry now has a fresh last_retry_at and is skipped.
        assert_eq!(subscriber.next_retry().await, Some(newer.clone()));
        assert_eq!(subscriber.next_retry().await, None);

        let rows = subscriber.failed_subscriptions().await;
        assert!(rows.iter().all(|r| r.entry.retry_count == 1));
    }

    #[tokio::test]
    async fn resync_flag_is_exclusive_per_key() {
        let ctx = test_ctx();
        let subscriber = StreamSubscriber { ctx };
        let key = PairKey::futures("BTCUSDT");

        assert!(subscriber.begin_resync(&key).await);
        assert!(!subscriber.begin_resync(&key).await);
        subscriber.finish_resync(&key).await;
        assert!(subscriber.begin_resync(&key).await);
    }
}
