pub mod aggregator;
pub mod cache;
pub mod candle_series;
pub mod synthetic;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::TimeframeAggregator;
pub use cache::{HistoricalCache, SharedSeries};
pub use candle_series::{Candle, CandleSeries, Upsert};
pub use synthetic::{random_walk, SyntheticTicker};
