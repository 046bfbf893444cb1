// =============================================================================
// Runtime Configuration — feed endpoints, series sizing, reconnect budget
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FeedError;
use crate::stream::ReconnectPolicy;
use crate::types::{normalize_symbol, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_timeframe() -> Timeframe {
    Timeframe::Minute1
}

fn default_stream_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_history_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_series_capacity() -> usize {
    120
}

fn default_seed_count() -> usize {
    120
}

fn default_base_timeframe() -> Timeframe {
    Timeframe::Second1
}

fn default_native_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::Second1, Timeframe::Minute1]
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_synthetic_tick_ms() -> u64 {
    1_000
}

fn default_base_prices() -> BTreeMap<String, f64> {
    [
        ("BTCUSDT", 65_000.0),
        ("ETHUSDT", 3_200.0),
        ("SOLUSDT", 150.0),
        ("BNBUSDT", 580.0),
        ("XRPUSDT", 0.6),
    ]
    .into_iter()
    .map(|(s, p)| (s.to_string(), p))
    .collect()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the candle engine and its HTTP surface.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Symbols ------------------------------------------------------------

    /// Symbols preloaded into the historical cache at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Selection activated at startup.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    #[serde(default = "default_timeframe")]
    pub default_timeframe: Timeframe,

    /// Symbols with a ticker-only price feed started at boot.
    #[serde(default)]
    pub ticker_symbols: Vec<String>,

    // --- Endpoints ----------------------------------------------------------

    /// WebSocket base; the stream name is appended as a path segment.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// REST base serving `GET {history_url}/history`.
    #[serde(default = "default_history_url")]
    pub history_url: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Series -------------------------------------------------------------

    /// Maximum candles retained per (symbol, timeframe).
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    /// Candles requested from the history source per series.
    #[serde(default = "default_seed_count")]
    pub seed_count: usize,

    /// Finest feed; coarser non-native timeframes are aggregated from it.
    #[serde(default = "default_base_timeframe")]
    pub base_timeframe: Timeframe,

    /// Timeframes the exchange streams directly.
    #[serde(default = "default_native_timeframes")]
    pub native_timeframes: Vec<Timeframe>,

    // --- Connection ---------------------------------------------------------

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive failed handshakes before falling back to synthetic data.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Timeout for one history request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Interval between synthetic ticks while degraded.
    #[serde(default = "default_synthetic_tick_ms")]
    pub synthetic_tick_ms: u64,

    /// Random-walk anchor per symbol.
    #[serde(default = "default_base_prices")]
    pub base_prices: BTreeMap<String, f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            default_symbol: default_symbol(),
            default_timeframe: default_timeframe(),
            ticker_symbols: Vec::new(),
            stream_url: default_stream_url(),
            history_url: default_history_url(),
            bind_addr: default_bind_addr(),
            series_capacity: default_series_capacity(),
            seed_count: default_seed_count(),
            base_timeframe: default_base_timeframe(),
            native_timeframes: default_native_timeframes(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            synthetic_tick_ms: default_synthetic_tick_ms(),
            base_prices: default_base_prices(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            default_symbol = %config.default_symbol,
            default_timeframe = %config.default_timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_*` overrides. `lookup` is `std::env::var` in the binary.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(symbols) = lookup("FEED_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Some(addr) = lookup("FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = lookup("FEED_STREAM_URL") {
            self.stream_url = url;
        }
        if let Some(url) = lookup("FEED_HISTORY_URL") {
            self.history_url = url;
        }
    }

    /// Reject settings the engine cannot run with and normalise symbols.
    pub fn validate(&mut self) -> Result<(), FeedError> {
        if self.series_capacity == 0 {
            return Err(FeedError::Config("series_capacity must be at least 1".into()));
        }
        if self.seed_count == 0 {
            return Err(FeedError::Config("seed_count must be at least 1".into()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(FeedError::Config(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.synthetic_tick_ms == 0 {
            return Err(FeedError::Config("synthetic_tick_ms must be positive".into()));
        }
        if !self.native_timeframes.contains(&self.base_timeframe) {
            return Err(FeedError::Config(format!(
                "base timeframe {} is not a native timeframe",
                self.base_timeframe
            )));
        }
        if let Some(tf) = Timeframe::ALL
            .into_iter()
            .find(|tf| !self.is_native(*tf) && !tf.is_coarser_than(self.base_timeframe))
        {
            return Err(FeedError::Config(format!(
                "timeframe {tf} is neither native nor derivable from {}",
                self.base_timeframe
            )));
        }

        self.symbols = self
            .symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .collect::<Result<_, _>>()
            .map_err(|e| FeedError::Config(e.to_string()))?;
        self.ticker_symbols = self
            .ticker_symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .collect::<Result<_, _>>()
            .map_err(|e| FeedError::Config(e.to_string()))?;
        self.default_symbol =
            normalize_symbol(&self.default_symbol).map_err(|e| FeedError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    pub fn is_native(&self, timeframe: Timeframe) -> bool {
        self.native_timeframes.contains(&timeframe)
    }

    pub fn synthetic_tick(&self) -> Duration {
        Duration::from_millis(self.synthetic_tick_ms)
    }
}
