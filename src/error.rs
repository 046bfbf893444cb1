// =============================================================================
// Error taxonomy for the ingestion path
// =============================================================================
//
// Every variant is handled by the component that detects it. Only
// `ExhaustedRetries` and `SeedFetch` travel up to the hub, where they switch
// the active selection into synthetic mode instead of failing.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Socket-level failure; the connection schedules a reconnect.
    #[error("transport error on {feed}: {reason}")]
    Transport { feed: String, reason: String },

    /// The reconnect budget is spent; the caller falls back to synthetic data.
    #[error("{feed}: gave up after {attempts} consecutive connection failures")]
    ExhaustedRetries { feed: String, attempts: u32 },

    /// A single inbound message could not be decoded and was dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Historical bootstrap failed; a synthetic seed replaces it.
    #[error("history fetch for {key} failed: {reason}")]
    SeedFetch { key: String, reason: String },

    /// A tick older than the newest bucket of its series.
    #[error("out-of-order tick for {key}: bucket {open_time} precedes latest {latest}")]
    OutOfOrderTick {
        key: String,
        open_time: i64,
        latest: i64,
    },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether this error should flag the selection as synthetic/offline.
    pub fn is_degrading(&self) -> bool {
        matches!(self, Self::ExhaustedRetries { .. } | Self::SeedFetch { .. })
    }
}
