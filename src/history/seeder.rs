use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use super::client::HistorySource;
use crate::clock::Clock;
use crate::error::FeedError;
use crate::market_data::{random_walk, CandleSeries};
use crate::types::{SeriesKey, Timeframe};

/// Random-walk anchor for symbols missing from the base price table.
const DEFAULT_BASE_PRICE: f64 = 100.0;

/// Result of seeding one series. `error` is set when the series had to be
/// synthesised because the history source failed.
#[derive(Debug, Clone)]
pub struct Seeded {
    pub series: CandleSeries,
    pub error: Option<FeedError>,
}

/// Builds initial series from the history source, falling back to a
/// deterministic random walk.
pub struct HistoricalSeeder {
    source: Arc<dyn HistorySource>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    base_prices: BTreeMap<String, f64>,
}

impl HistoricalSeeder {
    pub fn new(source: Arc<dyn HistorySource>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            source,
            clock,
            capacity: capacity.max(1),
            base_prices: BTreeMap::new(),
        }
    }

    pub fn with_base_prices(mut self, base_prices: BTreeMap<String, f64>) -> Self {
        self.base_prices = base_prices;
        self
    }

    pub fn base_price(&self, symbol: &str) -> f64 {
        self.base_prices
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_BASE_PRICE)
    }

    /// Seed the `count` most recent candles of `(symbol, timeframe)`.
    pub async fn seed(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Seeded {
        let key = SeriesKey::new(symbol, timeframe);

        let fetched = self
            .source
            .fetch(&key.symbol, timeframe, count)
            .await
            .and_then(|candles| {
                if candles.is_empty() {
                    Err(FeedError::SeedFetch {
                        key: key.to_string(),
                        reason: "no candles returned".into(),
                    })
                } else {
                    Ok(candles)
                }
            });

        match fetched {
            Ok(candles) => {
                let skip = candles.len().saturating_sub(count);
                let series = CandleSeries::from_candles(
                    key.clone(),
                    self.capacity,
                    candles.into_iter().skip(skip),
                    false,
                );
                info!(key = %key, candles = series.len(), "series seeded from history");
                Seeded {
                    series,
                    error: None,
                }
            }
            Err(e) => {
                let error = match e {
                    e @ FeedError::SeedFetch { .. } => e,
                    other => FeedError::SeedFetch {
                        key: key.to_string(),
                        reason: other.to_string(),
                    },
                };
                warn!(key = %key, error = %error, "history unavailable, using synthetic seed");
                let candles = random_walk(
                    &key.symbol,
                    timeframe,
                    count,
                    self.clock.now_ms(),
                    self.base_price(&key.symbol),
                );
                Seeded {
                    series: CandleSeries::from_candles(key, self.capacity, candles, true),
                    error: Some(error),
                }
            }
        }
    }

    /// Seed several timeframes of one symbol concurrently.
    pub async fn seed_all(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
        count: usize,
    ) -> Vec<Seeded> {
        join_all(timeframes.iter().map(|tf| self.seed(symbol, *tf, count))).await
    }
}
