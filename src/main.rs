//! Liquidity Monitor
//!
//! Replicates Binance order book depth for spot and linear futures pairs,
//! derives liquidity metrics on every update and persists them as time
//! series. Boot order: time-series store, metrics engine, per-pair spot
//! subscriptions, one combined futures stream, health supervisor.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use tokio::sync::RwLock;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidity_monitor::{
    AppState, Config, EventBus, ExchangeClient, HealthSupervisor, MetricsEngine,
    OrderBookStore, PairKey, Segment, StreamSubscriber, TimeSeriesStore,
};

/// Spacing between spot subscriptions at boot
const BOOT_SUBSCRIBE_SPACING_MS: u64 = 1000;
/// Retention sweep cadence for the time-series store
const SWEEP_INTERVAL_SECS: u64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting liquidity monitor");

    let config = Arc::new(Config::load()?);
    info!(pairs = ?config.pairs, "Configuration loaded");

    let timeseries = Arc::new(TimeSeriesStore::new());
    let store = Arc::new(RwLock::new(OrderBookStore::new()));
    let bus = EventBus::new();
    let client = Arc::new(ExchangeClient::new(&config)?);

    MetricsEngine::new(store.clone(), timeseries.clone(), bus.clone(), &config).spawn();

    let subscriber = Arc::new(StreamSubscriber::new(
        config.clone(),
        client.clone(),
        store.clone(),
        bus.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        subscriber: subscriber.clone(),
        timeseries: timeseries.clone(),
        client: client.clone(),
        bus,
    });

    // Status server runs from the start so boot progress is observable.
    let status_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_status_server(status_state).await {
            warn!(error = %e, "Status server error");
        }
    });

    // Retention sweep for the time-series store.
    let sweep_store = timeseries.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            sweep_store.sweep().await;
        }
    });

    for symbol in &config.pairs {
        if !subscriber.subscribe(symbol, Segment::Spot).await {
            warn!(symbol = %symbol, "Spot subscription not ready, supervisor will retry");
        }
        tokio::time::sleep(Duration::from_millis(BOOT_SUBSCRIBE_SPACING_MS)).await;
    }

    if !subscriber.subscribe_futures_combined(&config.pairs).await {
        warn!("Combined futures stream not ready, supervisor will retry");
    }

    HealthSupervisor::new(
        config.clone(),
        subscriber.clone(),
        store.clone(),
        client.clone(),
    )
    .spawn();

    info!("Boot complete");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    subscriber.shutdown_all().await;

    Ok(())
}

/// HTTP server for health, status and metrics endpoints
async fn start_status_server(state: Arc<AppState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/book/:segment/:symbol", get(book))
        .route("/liquidity/:segment/:symbol", get(liquidity))
        .route("/metrics", get(metrics))
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.status_port));
    info!(addr = %addr, "Starting status server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "liquidity-monitor",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let overall = state.subscriber.overall_status().await;
    Json(serde_json::json!({
        "exchange": {
            "banned": state.client.is_banned().await,
            "paused_until": state.client.paused_until().await,
            "used_weight": state.client.used_weight().await,
        },
        "subscriptions": overall,
    }))
}

fn parse_segment(segment: &str) -> Option<Segment> {
    match segment {
        "spot" => Some(Segment::Spot),
        "futures" => Some(Segment::Futures),
        _ => None,
    }
}

/// Top levels of one replica
async fn book(
    State(state): State<Arc<AppState>>,
    Path((segment, symbol)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let segment = parse_segment(&segment).ok_or(StatusCode::BAD_REQUEST)?;
    let key = PairKey::new(symbol.to_uppercase(), segment);

    let view = {
        let store = state.store.read().await;
        store.get(&key).ok_or(StatusCode::NOT_FOUND)?
    };

    const TOP_LEVELS: usize = 20;
    Ok(Json(serde_json::json!({
        "symbol": view.symbol,
        "segment": view.segment,
        "last_update_id": view.last_update_id,
        "timestamp_ms": view.timestamp_ms,
        "age_seconds": view.age_seconds,
        "bids": view.bids.iter().take(TOP_LEVELS).collect::<Vec<_>>(),
        "asks": view.asks.iter().take(TOP_LEVELS).collect::<Vec<_>>(),
    })))
}

/// Latest persisted metrics for one key
async fn liquidity(
    State(state): State<Arc<AppState>>,
    Path((segment, symbol)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let segment = parse_segment(&segment).ok_or(StatusCode::BAD_REQUEST)?;
    let key = PairKey::new(symbol.to_uppercase(), segment);

    let recent = state.timeseries.recent(&key, 1, true).await;
    if recent.core.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }

    let stats = state.timeseries.stats(&key).await;
    Ok(Json(serde_json::json!({
        "latest": recent,
        "stats": stats,
    })))
}

async fn metrics() -> String {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
