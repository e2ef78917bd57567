//! Liquidity Monitor Library
//!
//! This crate replicates Binance order book depth for spot and linear
//! futures pairs and derives liquidity metrics on every applied update.

use std::sync::Arc;
use tokio::sync::RwLock;

pub mod bus;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod stream;
pub mod supervisor;
pub mod timeseries;

pub use bus::{BusEvent, EventBus};
pub use config::Config;
pub use error::{MonitorError, Result};
pub use exchange::ExchangeClient;
pub use metrics::MetricsEngine;
pub use orderbook::{ApplyOutcome, OrderBookStore, PairKey, Segment};
pub use parser::{DepthDiff, DepthSnapshot, ParsedMessage};
pub use stream::StreamSubscriber;
pub use supervisor::HealthSupervisor;
pub use timeseries::TimeSeriesStore;

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<RwLock<OrderBookStore>>,
    pub subscriber: Arc<StreamSubscriber>,
    pub timeseries: Arc<TimeSeriesStore>,
    pub client: Arc<ExchangeClient>,
    pub bus: EventBus,
}
