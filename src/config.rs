//! Configuration module for the liquidity monitor

use serde::Deserialize;
use std::env;

/// Depth stream update interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UpdateInterval {
    Ms100,
    Ms500,
    Ms1000,
}

impl UpdateInterval {
    /// Parse the configured interval string. Unknown values fall back to
    /// 1000ms with a warning, matching the stream-name rules.
    pub fn parse(s: &str) -> Self {
        match s {
            "100ms" => UpdateInterval::Ms100,
            "500ms" => UpdateInterval::Ms500,
            "1000ms" => UpdateInterval::Ms1000,
            other => {
                tracing::warn!(interval = %other, "Unknown update interval, using 1000ms");
                UpdateInterval::Ms1000
            }
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Trading symbols to monitor (e.g., ["BTCUSDT", "ETHUSDT"])
    pub pairs: Vec<String>,

    /// Depth stream update interval (500ms is futures-only)
    pub update_interval: UpdateInterval,

    /// Spot WebSocket endpoint
    pub spot_ws_endpoint: String,

    /// Futures WebSocket endpoint
    pub futures_ws_endpoint: String,

    /// Spot REST API endpoint
    pub spot_rest_endpoint: String,

    /// Futures REST API endpoint
    pub futures_rest_endpoint: String,

    /// Minimum wait between retry-queue attempts for one key
    pub reconnect_delay_ms: u64,

    /// Client-initiated keep-alive interval
    pub ping_interval_ms: u64,

    /// Connection admission threshold over a sliding 60s window
    pub max_connections_per_minute: usize,

    /// Minimum interval between core metric writes per key
    pub core_save_interval_ms: i64,

    /// Minimum interval between advanced metric writes per key
    pub advanced_save_interval_ms: i64,

    /// Port for the status/metrics HTTP server
    pub status_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let pairs: Vec<String> = env::var("PAIRS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let update_interval = UpdateInterval::parse(
            &env::var("UPDATE_INTERVAL").unwrap_or_else(|_| "1000ms".to_string()),
        );

        Ok(Self {
            pairs,
            update_interval,
            spot_ws_endpoint: env::var("SPOT_WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
            futures_ws_endpoint: env::var("FUTURES_WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://fstream.binance.com".to_string()),
            spot_rest_endpoint: env::var("SPOT_REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            futures_rest_endpoint: env::var("FUTURES_REST_ENDPOINT")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            reconnect_delay_ms: env::var("RECONNECT_DELAY_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),
            ping_interval_ms: env::var("PING_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30000),
            max_connections_per_minute: env::var("MAX_CONNECTIONS_PER_MINUTE")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
            core_save_interval_ms: env::var("CORE_SAVE_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30000),
            advanced_save_interval_ms: env::var("ADVANCED_SAVE_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30000),
            status_port: env::var("STATUS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()
                .unwrap_or(9090),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairs: vec!["BTCUSDT".to_string()],
            update_interval: UpdateInterval::Ms1000,
            spot_ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            futures_ws_endpoint: "wss://fstream.binance.com".to_string(),
            spot_rest_endpoint: "https://api.binance.com".to_string(),
            futures_rest_endpoint: "https://fapi.binance.com".to_string(),
            reconnect_delay_ms: 5000,
            ping_interval_ms: 30000,
            max_connections_per_minute: 50,
            core_save_interval_ms: 30000,
            advanced_save_interval_ms: 30000,
            status_port: 9090,
        }
    }
}
