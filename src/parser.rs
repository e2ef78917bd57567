//! Parser module for Binance wire messages
//!
//! Handles deserialization of depth diffs, REST snapshots, combined-stream
//! envelopes and 24h ticker rows.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Binance depth diff message
///
/// Spot carries `U`/`u`; futures additionally carries `pu`, the final update
/// id of the previous stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthDiff {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Final update ID of the previous event (futures only)
    #[serde(rename = "pu", default)]
    pub prev_final_update_id: Option<u64>,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    /// Stream name, e.g. "btcusdt@depth@500ms"
    pub stream: String,

    /// Data payload
    pub data: serde_json::Value,
}

impl StreamEnvelope {
    /// Extract the upper-case symbol from the stream name.
    pub fn symbol(&self) -> Option<String> {
        self.stream
            .split('@')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_uppercase())
    }
}

/// One row of a 24h ticker response
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,

    #[serde(rename = "quoteVolume", deserialize_with = "deserialize_decimal")]
    pub quote_volume: Decimal,

    #[serde(rename = "priceChangePercent", deserialize_with = "deserialize_decimal")]
    pub price_change_percent: Decimal,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthDiff(DepthDiff),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message, unwrapping a combined-stream envelope
    /// if present.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        if let Ok(envelope) = serde_json::from_str::<StreamEnvelope>(raw) {
            return Self::parse_stream_data(&envelope.stream, &envelope.data);
        }

        if let Ok(diff) = serde_json::from_str::<DepthDiff>(raw) {
            if diff.event_type == "depthUpdate" {
                return Ok(ParsedMessage::DepthDiff(diff));
            }
        }

        Ok(ParsedMessage::Unknown(raw.to_string()))
    }

    fn parse_stream_data(
        stream: &str,
        data: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        if stream.contains("depth") {
            let diff: DepthDiff = serde_json::from_value(data.clone())?;
            Ok(ParsedMessage::DepthDiff(diff))
        } else {
            Ok(ParsedMessage::Unknown(data.to_string()))
        }
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spot_depth_diff() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::DepthDiff(diff) = msg {
            assert_eq!(diff.symbol, "BTCUSDT");
            assert_eq!(diff.first_update_id, 100);
            assert_eq!(diff.final_update_id, 105);
            assert_eq!(diff.prev_final_update_id, None);
            assert_eq!(diff.bids.len(), 2);
            assert_eq!(diff.bids[0].price, Decimal::from_str("50000.00").unwrap());
        } else {
            panic!("Expected DepthDiff");
        }
    }

    #[test]
    fn test_parse_futures_depth_diff_carries_pu() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "ETHUSDT",
            "U": 200,
            "u": 210,
            "pu": 199,
            "b": [],
            "a": [["3000.10", "4.0"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::DepthDiff(diff) = msg {
            assert_eq!(diff.prev_final_update_id, Some(199));
            assert_eq!(diff.asks.len(), 1);
        } else {
            panic!("Expected DepthDiff");
        }
    }

    #[test]
    fn test_parse_combined_envelope() {
        let raw = r#"{
            "stream": "btcusdt@depth@500ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "U": 300,
                "u": 305,
                "pu": 299,
                "b": [["50000.00", "1.0"]],
                "a": []
            }
        }"#;

        let envelope: StreamEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.symbol().as_deref(), Some("BTCUSDT"));

        let msg = ParsedMessage::parse(raw).unwrap();
        assert!(matches!(msg, ParsedMessage::DepthDiff(_)));
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{
            "lastUpdateId": 1000,
            "bids": [["50000.00", "1.5"]],
            "asks": [["50001.00", "2.5"]]
        }"#;

        let snapshot: DepthSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.last_update_id, 1000);
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.asks[0].quantity, Decimal::from_str("2.5").unwrap());
    }

    #[test]
    fn test_parse_ticker_row() {
        let raw = r#"{
            "symbol": "BTCUSDT",
            "quoteVolume": "123456789.12",
            "priceChangePercent": "-1.75"
        }"#;

        let row: Ticker24h = serde_json::from_str(raw).unwrap();
        assert_eq!(row.symbol, "BTCUSDT");
        assert!(row.price_change_percent < Decimal::ZERO);
    }

    #[test]
    fn test_unknown_message() {
        let msg = ParsedMessage::parse(r#"{"result": null, "id": 1}"#).unwrap();
        assert!(matches!(msg, ParsedMessage::Unknown(_)));
    }
}
