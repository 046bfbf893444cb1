// =============================================================================
// candle-hub — live market-data ingestion and multi-timeframe candle engine
// =============================================================================
//
// Layers, leaf first:
//   stream       one socket per feed, reconnect/backoff, message decoding
//   market_data  bounded candle series, timeframe aggregation, shared cache
//   history      REST bootstrap with synthetic fallback
//   hub          selection, switch-over, fan-out to listeners
//   api          HTTP + WebSocket surface over the hub
// =============================================================================

pub mod api;
pub mod app_state;
pub mod clock;
pub mod error;
pub mod history;
pub mod hub;
pub mod market_data;
pub mod runtime_config;
pub mod stream;
pub mod types;

pub use error::FeedError;
pub use hub::{HubPhase, HubStatus, MarketDataHub, SeriesSnapshot, SeriesUpdate, Subscription};
pub use market_data::{Candle, CandleSeries};
pub use runtime_config::RuntimeConfig;
pub use types::{FeedKey, FeedMode, SeriesKey, Timeframe};
