// =============================================================================
// Feed message decoding
// =============================================================================
//
// Kline events (single stream, no outer wrapper):
// ```json
// { "e": "kline", "s": "BTCUSDT", "k": { "t": 1700000000000, "i": "1m",
//   "o": "100.0", "h": "101.0", "l": "99.5", "c": "100.7", "x": false } }
// ```
// Combined streams wrap the same payload as `{ "stream": ..., "data": {...} }`.
// Ticker events carry `"e": "24hrTicker"`, event time `E` and last price `c`.
// =============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::error::FeedError;
use crate::market_data::Candle;
use crate::types::FeedKey;

/// One decoded price update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// The exchange marked the bucket closed.
    pub is_final: bool,
    pub synthetic: bool,
}

impl Tick {
    /// Price-only tick: `open = high = low = close = price`.
    pub fn price(symbol: impl Into<String>, ts_ms: i64, price: f64, synthetic: bool) -> Self {
        Self {
            symbol: symbol.into(),
            open_time: ts_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            is_final: false,
            synthetic,
        }
    }

    pub fn to_candle(&self) -> Candle {
        Candle {
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            synthetic: self.synthetic,
        }
        .normalized()
    }
}

/// Decode one text frame for `feed`.
///
/// Returns `Ok(None)` for well-formed events that belong to another stream or
/// event type, and [`FeedError::MalformedMessage`] when a required field is
/// missing or unparseable.
pub fn parse_feed_message(feed: &FeedKey, text: &str) -> Result<Option<Tick>, FeedError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| FeedError::MalformedMessage(format!("invalid JSON: {e}")))?;

    // Support both combined-stream envelope and direct single-stream payload.
    let data = match root.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => &root,
    };

    match feed {
        FeedKey::Kline { symbol, timeframe } => {
            if !event_is(data, "kline", "k") || !symbol_is(data, symbol) {
                return Ok(None);
            }
            let k = data
                .get("k")
                .filter(|k| k.is_object())
                .ok_or_else(|| malformed("missing field k"))?;
            if let Some(interval) = k.get("i").and_then(Value::as_str) {
                if interval != timeframe.as_str() {
                    return Ok(None);
                }
            }

            let open_time = k
                .get("t")
                .and_then(Value::as_i64)
                .ok_or_else(|| malformed("missing field k.t"))?;

            Ok(Some(Tick {
                symbol: symbol.clone(),
                open_time,
                open: parse_num(k, "o")?,
                high: parse_num(k, "h")?,
                low: parse_num(k, "l")?,
                close: parse_num(k, "c")?,
                is_final: k.get("x").and_then(Value::as_bool).unwrap_or(false),
                synthetic: false,
            }))
        }
        FeedKey::Ticker { symbol } => {
            if !event_is(data, "24hrTicker", "c") || !symbol_is(data, symbol) {
                return Ok(None);
            }
            let event_time = data
                .get("E")
                .and_then(Value::as_i64)
                .ok_or_else(|| malformed("missing field E"))?;
            let price = parse_num(data, "c")?;
            Ok(Some(Tick::price(symbol.clone(), event_time, price, false)))
        }
    }
}

/// Without an `e` field the payload is accepted when it carries `marker`,
/// which skips subscription acks like `{"result":null,"id":1}`.
fn event_is(data: &Value, expected: &str, marker: &str) -> bool {
    match data.get("e").and_then(Value::as_str) {
        Some(event) => event == expected,
        None => data.get(marker).is_some(),
    }
}

fn symbol_is(data: &Value, expected: &str) -> bool {
    match data.get("s").and_then(Value::as_str) {
        Some(s) => s.eq_ignore_ascii_case(expected),
        None => true,
    }
}

/// Numeric fields arrive as strings (`"100.5"`) or plain numbers.
fn parse_num(obj: &Value, field: &str) -> Result<f64, FeedError> {
    let value = obj
        .get(field)
        .ok_or_else(|| malformed(&format!("missing field {field}")))?;
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(malformed(&format!("field {field} is not a number: {value}"))),
    }
}

fn malformed(reason: &str) -> FeedError {
    FeedError::MalformedMessage(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn kline_json(symbol: &str, interval: &str, t: i64, close: &str, closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":{t},"s":"{symbol}","k":{{"t":{t},"T":{},"s":"{symbol}","i":"{interval}","o":"100.0","c":"{close}","h":"105.0","l":"99.0","v":"12.5","x":{closed}}}}}"#,
            t + 59_999
        )
    }

    #[test]
    fn parses_single_stream_kline() {
        let feed = FeedKey::kline("BTCUSDT", Timeframe::Minute1);
        let tick = parse_feed_message(&feed, &kline_json("BTCUSDT", "1m", 60_000, "103.5", true))
            .unwrap()
            .unwrap();

        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.open_time, 60_000);
        assert_eq!(tick.open, 100.0);
        assert_eq!(tick.high, 105.0);
        assert_eq!(tick.low, 99.0);
        assert_eq!(tick.close, 103.5);
        assert!(tick.is_final);
        assert!(!tick.synthetic);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let feed = FeedKey::kline("ETHUSDT", Timeframe::Second1);
        let inner = kline_json("ETHUSDT", "1s", 1_000, "3200.1", false);
        let wrapped = format!(r#"{{"stream":"ethusdt@kline_1s","data":{inner}}}"#);
        let tick = parse_feed_message(&feed, &wrapped).unwrap().unwrap();
        assert_eq!(tick.close, 3200.1);
        assert!(!tick.is_final);
    }

    #[test]
    fn numeric_fields_may_be_numbers() {
        let feed = FeedKey::kline("BTCUSDT", Timeframe::Minute1);
        let text = r#"{"e":"kline","s":"BTCUSDT","k":{"t":0,"i":"1m","o":1,"h":2.5,"l":0.5,"c":2}}"#;
        let tick = parse_feed_message(&feed, text).unwrap().unwrap();
        assert_eq!((tick.open, tick.high, tick.low, tick.close), (1.0, 2.5, 0.5, 2.0));
    }

    #[test]
    fn other_streams_are_ignored() {
        let feed = FeedKey::kline("BTCUSDT", Timeframe::Minute1);
        assert_eq!(
            parse_feed_message(&feed, &kline_json("ETHUSDT", "1m", 0, "1", false)).unwrap(),
            None
        );
        assert_eq!(
            parse_feed_message(&feed, &kline_json("BTCUSDT", "5m", 0, "1", false)).unwrap(),
            None
        );
        assert_eq!(
            parse_feed_message(&feed, r#"{"e":"trade","s":"BTCUSDT","p":"1"}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_feed_message(&feed, r#"{"result":null,"id":1}"#).unwrap(),
            None
        );
    }

    #[test]
    fn missing_fields_are_malformed() {
        let feed = FeedKey::kline("BTCUSDT", Timeframe::Minute1);
        let no_close = r#"{"e":"kline","s":"BTCUSDT","k":{"t":0,"i":"1m","o":"1","h":"1","l":"1"}}"#;
        assert!(matches!(
            parse_feed_message(&feed, no_close),
            Err(FeedError::MalformedMessage(_))
        ));
        let bad_num = r#"{"e":"kline","s":"BTCUSDT","k":{"t":0,"i":"1m","o":"x","h":"1","l":"1","c":"1"}}"#;
        assert!(parse_feed_message(&feed, bad_num).is_err());
        assert!(parse_feed_message(&feed, "not json").is_err());
    }

    #[test]
    fn parses_ticker_as_price_tick() {
        let feed = FeedKey::ticker("SOLUSDT");
        let text = r#"{"e":"24hrTicker","E":1700000000123,"s":"SOLUSDT","c":"151.25","o":"149.0"}"#;
        let tick = parse_feed_message(&feed, text).unwrap().unwrap();
        assert_eq!(tick.open_time, 1_700_000_000_123);
        assert_eq!(tick.close, 151.25);
        assert_eq!(tick.open, 151.25);
        assert_eq!(tick.high, tick.low);
    }

    #[test]
    fn to_candle_repairs_range() {
        let tick = Tick {
            symbol: "BTCUSDT".into(),
            open_time: 0,
            open: 10.0,
            high: 9.0,
            low: 11.0,
            close: 10.5,
            is_final: false,
            synthetic: true,
        };
        let candle = tick.to_candle();
        assert!(candle.is_consistent());
        assert!(candle.synthetic);
    }
}
