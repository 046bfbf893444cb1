// =============================================================================
// History REST client — bootstrap candles for one (symbol, timeframe)
// =============================================================================
//
// GET {base}/history?symbol=BTCUSDT&timeframe=1m&limit=120
//
// Accepted bodies:
//   [ {"openTime":..,"open":..,"high":..,"low":..,"close":..}, ... ]
//   [ [openTime, "open", "high", "low", "close", ...], ... ]
//   { "data": [...] }  or  { "candles": [...] }
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::FeedError;
use crate::market_data::Candle;
use crate::types::{SeriesKey, Timeframe};

/// Anything that can return the most recent candles of a series, oldest first.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct RestHistorySource {
    base_url: String,
    client: reqwest::Client,
}

impl RestHistorySource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl HistorySource for RestHistorySource {
    #[instrument(skip(self), name = "history::fetch")]
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let key = SeriesKey::new(symbol, timeframe);
        let seed_err = |reason: String| FeedError::SeedFetch {
            key: key.to_string(),
            reason,
        };

        let url = format!("{}/history", self.base_url);
        let limit = limit.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", key.symbol.as_str()),
                ("timeframe", timeframe.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| seed_err(format!("GET {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(seed_err(format!("GET {url} returned {status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| seed_err(format!("failed to parse history response: {e}")))?;

        let candles = parse_history_payload(&body).map_err(seed_err)?;
        if candles.is_empty() {
            return Err(seed_err("history response is empty".into()));
        }

        debug!(key = %key, count = candles.len(), "history fetched");
        Ok(candles)
    }
}

/// Decode a history body into candles sorted by open time. Entries that are
/// individually broken are skipped; a body of the wrong shape is an error.
pub fn parse_history_payload(body: &Value) -> Result<Vec<Candle>, String> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(obj) => obj
            .get("data")
            .or_else(|| obj.get("candles"))
            .and_then(Value::as_array)
            .ok_or_else(|| "history object has no data/candles array".to_string())?,
        other => return Err(format!("history response is not an array: {other}")),
    };

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_entry(row) {
            Some(candle) => candles.push(candle),
            None => warn!(entry = %row, "skipping malformed history entry"),
        }
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

fn parse_entry(row: &Value) -> Option<Candle> {
    let (open_time, open, high, low, close) = match row {
        Value::Array(arr) if arr.len() >= 5 => (
            as_i64(&arr[0])?,
            as_f64(&arr[1])?,
            as_f64(&arr[2])?,
            as_f64(&arr[3])?,
            as_f64(&arr[4])?,
        ),
        Value::Object(obj) => (
            obj.get("openTime").or_else(|| obj.get("time")).and_then(as_i64)?,
            obj.get("open").and_then(as_f64)?,
            obj.get("high").and_then(as_f64)?,
            obj.get("low").and_then(as_f64)?,
            obj.get("close").and_then(as_f64)?,
        ),
        _ => return None,
    };
    Some(Candle::new(open_time, open, high, low, close))
}

fn as_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::String(s) => s.parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
