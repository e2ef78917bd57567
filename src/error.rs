//! Error types for the liquidity monitor

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Liquidity monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("REST API access banned by exchange (HTTP 418)")]
    Banned,

    #[error("REST API rate limited until {until}")]
    RateLimited { until: DateTime<Utc> },

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Subscription for {0} not ready within init deadline")]
    InitTimeout(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MonitorError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        MonitorError::RestApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
