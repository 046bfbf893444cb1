// =============================================================================
// Shared types used across the candle engine
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

// =============================================================================
// Timeframe
// =============================================================================

/// Supported candle bucket widths, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    Second1,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
}

impl Timeframe {
    /// Every supported timeframe, ordered from finest to coarsest.
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Second1,
        Timeframe::Minute1,
        Timeframe::Minute5,
        Timeframe::Minute15,
        Timeframe::Minute30,
        Timeframe::Hour1,
    ];

    /// Bucket width in milliseconds.
    pub const fn width_ms(self) -> i64 {
        match self {
            Self::Second1 => 1_000,
            Self::Minute1 => 60_000,
            Self::Minute5 => 300_000,
            Self::Minute15 => 900_000,
            Self::Minute30 => 1_800_000,
            Self::Hour1 => 3_600_000,
        }
    }

    /// Wire name, identical to the exchange interval string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second1 => "1s",
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Hour1 => "1h",
        }
    }

    /// Start of the bucket containing `ts_ms`. Floors towards negative
    /// infinity so pre-epoch timestamps still land on a bucket boundary.
    pub fn bucket_start(self, ts_ms: i64) -> i64 {
        let width = self.width_ms();
        ts_ms.div_euclid(width) * width
    }

    /// True when every bucket of `self` is an exact union of `finer` buckets.
    pub fn is_coarser_than(self, finer: Timeframe) -> bool {
        self.width_ms() > finer.width_ms() && self.width_ms() % finer.width_ms() == 0
    }

    /// Per-candle relative volatility used by the synthetic random walk.
    pub fn synthetic_volatility(self) -> f64 {
        match self {
            Self::Second1 => 0.0003,
            Self::Minute1 => 0.002,
            Self::Minute5 => 0.004,
            Self::Minute15 => 0.006,
            Self::Minute30 => 0.009,
            Self::Hour1 => 0.012,
        }
    }
}

impl FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1s" | "second1" => Ok(Self::Second1),
            "1m" | "minute1" => Ok(Self::Minute1),
            "5m" | "minute5" => Ok(Self::Minute5),
            "15m" | "minute15" => Ok(Self::Minute15),
            "30m" | "minute30" => Ok(Self::Minute30),
            "1h" | "60m" | "hour1" => Ok(Self::Hour1),
            other => Err(FeedError::InvalidSelection(format!(
                "unknown timeframe: {other}"
            ))),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Build a key; the symbol is stored upper-cased.
    pub fn new(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Identity of one physical streaming subscription.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedKey {
    Kline { symbol: String, timeframe: Timeframe },
    Ticker { symbol: String },
}

impl FeedKey {
    pub fn kline(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self::Kline {
            symbol: symbol.as_ref().trim().to_uppercase(),
            timeframe,
        }
    }

    pub fn ticker(symbol: impl AsRef<str>) -> Self {
        Self::Ticker {
            symbol: symbol.as_ref().trim().to_uppercase(),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Kline { symbol, .. } | Self::Ticker { symbol } => symbol,
        }
    }

    /// Exchange stream name, e.g. `btcusdt@kline_1m` or `btcusdt@ticker`.
    pub fn stream_name(&self) -> String {
        match self {
            Self::Kline { symbol, timeframe } => {
                format!("{}@kline_{}", symbol.to_lowercase(), timeframe)
            }
            Self::Ticker { symbol } => format!("{}@ticker", symbol.to_lowercase()),
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_name())
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Whether the active series is driven by market data or fabricated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMode {
    Live,
    Synthetic,
}

impl Default for FeedMode {
    fn default() -> Self {
        Self::Live
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Synthetic => write!(f, "Synthetic"),
        }
    }
}

/// Validate and normalise a user-supplied symbol.
pub fn normalize_symbol(raw: &str) -> Result<String, FeedError> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(FeedError::InvalidSelection("empty symbol".into()));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(FeedError::InvalidSelection(format!(
            "symbol must be alphanumeric: {raw}"
        )));
    }
    Ok(symbol)
}
