// =============================================================================
// Central Application State — HTTP/WS view over the market data hub
// =============================================================================
//
// The hub owns every series and connection; AppState adds what only the
// serving layer needs: WebSocket bookkeeping, a ring buffer of degraded-mode
// events, and uptime.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::hub::{HubStatus, MarketDataHub};
use crate::types::SeriesKey;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded degraded-mode event for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Selection the event applied to, e.g. `BTCUSDT@1m`.
    pub selection: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Last price of a tracked ticker.
#[derive(Debug, Clone, Serialize)]
pub struct TickerQuote {
    pub symbol: String,
    pub price: Option<f64>,
    /// Set when the feed gave up; `price` is then the last one seen.
    pub offline: Option<String>,
}

/// Everything `/api/v1/status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub status: HubStatus,
    pub cached: Vec<SeriesKey>,
    pub tickers: Vec<TickerQuote>,
    pub recent_errors: Vec<ErrorRecord>,
    pub ws_clients: usize,
    pub uptime_secs: u64,
    pub server_time: i64,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

pub struct AppState {
    pub hub: Arc<MarketDataHub>,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,
    pub ws_clients: AtomicUsize,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the server was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(hub: Arc<MarketDataHub>) -> Self {
        Self {
            hub,
            ws_sequence_number: AtomicU64::new(0),
            ws_clients: AtomicUsize::new(0),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an event. The ring buffer is capped at [`MAX_RECENT_ERRORS`];
    /// oldest entries are evicted when the limit is reached.
    pub fn push_error(&self, message: String, selection: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            selection,
            at: Utc::now().to_rfc3339(),
        });
        if errors.len() > MAX_RECENT_ERRORS {
            let overflow = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(..overflow);
        }
    }

    /// Record every transition into degraded mode reported by the hub,
    /// including ticker feeds going offline.
    pub fn spawn_status_recorder(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let mut rx = self.hub.watch_status();
        tokio::spawn(async move {
            let mut last_reason: Option<String> = None;
            let mut offline: BTreeMap<String, String> = BTreeMap::new();
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                for (symbol, reason) in &status.offline_tickers {
                    if !offline.contains_key(symbol) {
                        warn!(symbol = %symbol, reason = %reason, "ticker feed offline");
                        state.push_error(reason.clone(), Some(symbol.clone()));
                    }
                }
                offline = status.offline_tickers.clone();
                if status.degraded_reason != last_reason {
                    match &status.degraded_reason {
                        Some(reason) => {
                            warn!(reason = %reason, "selection degraded");
                            state.push_error(
                                reason.clone(),
                                status.selection.as_ref().map(|k| k.to_string()),
                            );
                        }
                        None if last_reason.is_some() => info!("selection back on live data"),
                        None => {}
                    }
                    last_reason = status.degraded_reason;
                }
            }
        })
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let tickers = self
            .hub
            .tracked_tickers()
            .into_iter()
            .map(|symbol| TickerQuote {
                price: self.hub.last_price(&symbol),
                offline: self.hub.ticker_offline_reason(&symbol),
                symbol,
            })
            .collect();

        StateSnapshot {
            status: self.hub.status(),
            cached: self.hub.cached_keys(),
            tickers,
            recent_errors: self.recent_errors.read().clone(),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::history::RestHistorySource;
    use crate::runtime_config::RuntimeConfig;
    use crate::stream::WsTransport;
    use std::time::Duration;

    fn state() -> AppState {
        let hub = MarketDataHub::new(
            RuntimeConfig::default(),
            Arc::new(WsTransport::new("ws://127.0.0.1:1")),
            Arc::new(RestHistorySource::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap()),
            Arc::new(SystemClock),
        )
        .unwrap();
        AppState::new(Arc::new(hub))
    }

    #[test]
    fn error_ring_is_capped() {
        let state = state();
        for i in 0..(MAX_RECENT_ERRORS + 7) {
            state.push_error(format!("event {i}"), None);
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "event 7");
    }

    #[test]
    fn sequence_starts_at_one() {
        let state = state();
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
    }

    #[test]
    fn snapshot_of_idle_hub() {
        let snapshot = state().build_snapshot();
        assert_eq!(snapshot.status, HubStatus::default());
        assert!(snapshot.cached.is_empty());
        assert!(snapshot.tickers.is_empty());
        assert_eq!(snapshot.ws_clients, 0);
    }
}
