//! REST client for exchange depth and ticker endpoints
//!
//! Tracks the per-minute request-weight budget and latches the
//! process-wide ban (418) and rate-limit pause (429) states.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::orderbook::MAJOR_PAIRS;
use crate::parser::{DepthSnapshot, Ticker24h};

const REST_TIMEOUT_SECS: u64 = 10;
const TICKER_WEIGHT: u64 = 40;
/// Warn when the tracked window weight crosses this share of the exchange cap
const WEIGHT_WARN_THRESHOLD: u64 = 5000;

/// Depth request limit and its request weight for a symbol
fn depth_limit_for(symbol: &str) -> (u32, u64) {
    if MAJOR_PAIRS.contains(&symbol) {
        (500, 10)
    } else {
        (100, 5)
    }
}

/// Process-wide REST throttling state
#[derive(Debug)]
struct RestState {
    used_weight: u64,
    window_started: DateTime<Utc>,
    banned: bool,
    paused_until: Option<DateTime<Utc>>,
}

impl RestState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            used_weight: 0,
            window_started: now,
            banned: false,
            paused_until: None,
        }
    }

    /// Fail fast while banned or inside a rate-limit pause
    fn ensure_available(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.banned {
            return Err(MonitorError::Banned);
        }
        if let Some(until) = self.paused_until {
            if now < until {
                return Err(MonitorError::RateLimited { until });
            }
            self.paused_until = None;
        }
        Ok(())
    }

    /// Charge an estimated request weight against the current minute window
    fn charge(&mut self, cost: u64, now: DateTime<Utc>) {
        if now - self.window_started >= Duration::seconds(60) {
            self.used_weight = 0;
            self.window_started = now;
        }
        self.used_weight += cost;
        if self.used_weight > WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = self.used_weight, "Request weight budget running high");
        }
    }

    /// Server-reported used weight supersedes the local estimate
    fn observe_used_weight(&mut self, weight: u64) {
        self.used_weight = weight;
    }

    fn on_banned(&mut self) {
        self.banned = true;
    }

    fn on_rate_limited(&mut self, retry_after_secs: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + Duration::seconds(retry_after_secs.max(1));
        self.paused_until = Some(until);
        until
    }
}

/// Merged 24h volume row across segments
#[derive(Debug, Clone)]
pub struct VolumeEntry {
    pub symbol: String,
    pub spot_volume: Decimal,
    pub futures_volume: Decimal,
    pub price_change_percent: Decimal,
}

/// REST client for spot and futures market data
pub struct ExchangeClient {
    http: reqwest::Client,
    spot_base: String,
    futures_base: String,
    state: Mutex<RestState>,
}

impl ExchangeClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            spot_base: config.spot_rest_endpoint.clone(),
            futures_base: config.futures_rest_endpoint.clone(),
            state: Mutex::new(RestState::new(Utc::now())),
        })
    }

    /// Fetch a spot depth snapshot
    pub async fn fetch_spot_depth(&self, symbol: &str) -> Result<DepthSnapshot> {
        let (limit, weight) = depth_limit_for(symbol);
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.spot_base, symbol, limit
        );

        let response = self.send(&url, weight).await?;
        Ok(response.json::<DepthSnapshot>().await?)
    }

    /// Fetch a futures depth snapshot. A symbol without a futures
    /// instrument yields `Ok(None)` rather than an error.
    pub async fn fetch_futures_depth(&self, symbol: &str) -> Result<Option<DepthSnapshot>> {
        let (limit, weight) = depth_limit_for(symbol);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.futures_base, symbol, limit
        );

        match self.send(&url, weight).await {
            Ok(response) => Ok(Some(response.json::<DepthSnapshot>().await?)),
            Err(MonitorError::RestApi(msg)) if msg.contains("HTTP 400") => {
                info!(symbol = %symbol, "No futures instrument for symbol");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch 24h ticker rows for both segments, merged by symbol
    pub async fn fetch_top_volumes(&self) -> Result<Vec<VolumeEntry>> {
        let spot_url = format!("{}/api/v3/ticker/24hr", self.spot_base);
        let futures_url = format!("{}/fapi/v1/ticker/24hr", self.futures_base);

        let spot: Vec<Ticker24h> = self.send(&spot_url, TICKER_WEIGHT).await?.json().await?;
        let futures: Vec<Ticker24h> =
            self.send(&futures_url, TICKER_WEIGHT).await?.json().await?;

        let mut merged: HashMap<String, VolumeEntry> = HashMap::new();
        for row in spot {
            merged.insert(
                row.symbol.clone(),
                VolumeEntry {
                    symbol: row.symbol,
                    spot_volume: row.quote_volume,
                    futures_volume: Decimal::ZERO,
                    price_change_percent: row.price_change_percent,
                },
            );
        }
        for row in futures {
            merged
                .entry(row.symbol.clone())
                .and_modify(|e| e.futures_volume = row.quote_volume)
                .or_insert(VolumeEntry {
                    symbol: row.symbol,
                    spot_volume: Decimal::ZERO,
                    futures_volume: row.quote_volume,
                    price_change_percent: row.price_change_percent,
                });
        }

        let mut entries: Vec<VolumeEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| {
            (b.spot_volume + b.futures_volume).cmp(&(a.spot_volume + a.futures_volume))
        });
        Ok(entries)
    }

    /// Issue one GET under the throttling state machine
    async fn send(&self, url: &str, weight: u64) -> Result<reqwest::Response> {
        {
            let mut state = self.state.lock().await;
            state.ensure_available(Utc::now())?;
            state.charge(weight, Utc::now());
        }

        let response = self.http.get(url).send().await?;
        let status = response.status();

        if let Some(weight) = response
            .headers()
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.state.lock().await.observe_used_weight(weight);
        }

        if status.as_u16() == 418 {
            self.state.lock().await.on_banned();
            warn!(url = %url, "Exchange returned 418, REST access banned until operator reset");
            return Err(MonitorError::Banned);
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60);
            let until = self
                .state
                .lock()
                .await
                .on_rate_limited(retry_after, Utc::now());
            warn!(url = %url, until = %until, "Exchange rate limit hit, pausing REST");
            return Err(MonitorError::RateLimited { until });
        }
        if !status.is_success() {
            return Err(MonitorError::RestApi(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        Ok(response)
    }

    pub async fn is_banned(&self) -> bool {
        self.state.lock().await.banned
    }

    pub async fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.paused_until
    }

    pub async fn used_weight(&self) -> u64 {
        self.state.lock().await.used_weight
    }

    /// Operator action: clear the 418 latch
    pub async fn reset_ban(&self) {
        let mut state = self.state.lock().await;
        if state.banned {
            info!("REST ban flag reset by operator");
        }
        state.banned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_limits_by_pair_class() {
        assert_eq!(depth_limit_for("BTCUSDT"), (500, 10));
        assert_eq!(depth_limit_for("ETHUSDT"), (500, 10));
        assert_eq!(depth_limit_for("XRPUSDT"), (100, 5));
    }

    #[test]
    fn banned_latch_fails_fast_until_reset() {
        let now = Utc::now();
        let mut state = RestState::new(now);
        assert!(state.ensure_available(now).is_ok());

        state.on_banned();
        assert!(matches!(
            state.ensure_available(now),
            Err(MonitorError::Banned)
        ));

        state.banned = false;
        assert!(state.ensure_available(now).is_ok());
    }

    #[test]
    fn rate_limit_pause_elapses() {
        let now = Utc::now();
        let mut state = RestState::new(now);
        let until = state.on_rate_limited(30, now);
        assert_eq!(until, now + Duration::seconds(30));

        assert!(matches!(
            state.ensure_available(now + Duration::seconds(10)),
            Err(MonitorError::RateLimited { .. })
        ));
        assert!(state
            .ensure_available(now + Duration::seconds(31))
            .is_ok());
        // The pause clears once elapsed.
        assert!(state.paused_until.is_none());
    }

    #[test]
    fn weight_window_rolls_over_each_minute() {
        let now = Utc::now();
        let mut state = RestState::new(now);
        state.charge(10, now);
        state.charge(5, now + Duration::seconds(30));
        assert_eq!(state.used_weight, 15);

        state.charge(40, now + Duration::seconds(61));
        assert_eq!(state.used_weight, 40);
    }

    #[test]
    fn server_reported_weight_wins() {
        let now = Utc::now();
        let mut state = RestState::new(now);
        state.charge(10, now);
        state.observe_used_weight(123);
        assert_eq!(state.used_weight, 123);
    }
}
