// =============================================================================
// WebSocket Handler — Push-based series updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` (optionally `?symbol=BTCUSDT`) and receive:
//   1. The hub status and a snapshot of the active selection on connect.
//   2. Every accepted series update, with the full series attached.
//   3. A new status whenever the hub's status changes.
//
// Updates are handed from the hub's listener callback to the socket task via a
// bounded channel. A client that cannot keep up loses updates instead of
// stalling the feed worker; every update carries the whole series, so the next
// one that arrives brings it back in sync.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::hub::{HubStatus, SeriesSnapshot, SeriesUpdate};
use crate::market_data::Candle;
use crate::types::SeriesKey;

const UPDATE_BUFFER: usize = 64;

// =============================================================================
// Query parameters & wire format
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    /// Only push updates for this symbol.
    symbol: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WsPush<'a> {
    Status(&'a HubStatus),
    Snapshot(&'a SeriesSnapshot),
    Update {
        #[serde(flatten)]
        key: &'a SeriesKey,
        latest: &'a Candle,
        synthetic: bool,
        candles: &'a [Candle],
    },
}

#[derive(Serialize)]
struct WsEnvelope<'a> {
    seq: u64,
    #[serde(flatten)]
    push: WsPush<'a>,
}

fn wants(filter: Option<&str>, key: &SeriesKey) -> bool {
    filter.map_or(true, |symbol| key.symbol == symbol)
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let filter = query
        .symbol
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());
    info!(filter = ?filter, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, filter))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// One `tokio::select!` loop multiplexes series updates from the hub, status
/// changes and incoming client frames (Ping/Pong, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, filter: Option<String>) {
    state.ws_clients.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut updates) = mpsc::channel::<SeriesUpdate>(UPDATE_BUFFER);
    let listener_filter = filter.clone();
    let subscription = state.hub.subscribe(move |update| {
        if wants(listener_filter.as_deref(), &update.key) && tx.try_send(update.clone()).is_err() {
            debug!(series = %update.key, "WebSocket client lagging — update dropped");
        }
    });
    let mut status_rx = state.hub.watch_status();

    // Initial status and snapshot of the active selection.
    let status = status_rx.borrow_and_update().clone();
    if let Err(e) = send_push(&mut sender, &state, WsPush::Status(&status)).await {
        warn!(error = %e, "Failed to send initial WebSocket status");
        subscription.unsubscribe();
        cleanup(&state);
        return;
    }
    let initial = status
        .selection
        .as_ref()
        .filter(|key| wants(filter.as_deref(), key))
        .and_then(|key| state.hub.series(&key.symbol, key.timeframe));
    if let Some(snapshot) = initial {
        if let Err(e) = send_push(&mut sender, &state, WsPush::Snapshot(&snapshot)).await {
            warn!(error = %e, "Failed to send initial WebSocket snapshot");
            subscription.unsubscribe();
            cleanup(&state);
            return;
        }
    }

    loop {
        tokio::select! {
            // ── Series updates from the hub ─────────────────────────────
            Some(update) = updates.recv() => {
                let push = WsPush::Update {
                    key: &update.key,
                    latest: &update.latest,
                    synthetic: update.synthetic,
                    candles: &update.snapshot,
                };
                if let Err(e) = send_push(&mut sender, &state, push).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Status changes ──────────────────────────────────────────
            changed = status_rx.changed() => {
                if changed.is_err() {
                    info!("Hub status channel closed — disconnecting");
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                if let Err(e) = send_push(&mut sender, &state, WsPush::Status(&status)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Incoming client frames ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("WebSocket Ping received — sending Pong");
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    subscription.unsubscribe();
    cleanup(&state);
}

// =============================================================================
// Helpers
// =============================================================================

/// Serialize one push with the next global sequence number and send it.
async fn send_push<S>(sender: &mut S, state: &AppState, push: WsPush<'_>) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let envelope = WsEnvelope {
        seq: state.next_sequence(),
        push,
    };
    match serde_json::to_string(&envelope) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(seq = envelope.seq, "WebSocket push sent");
            Ok(())
        }
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize WebSocket push");
            Ok(())
        }
    }
}

fn cleanup(state: &AppState) {
    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
    info!("WebSocket connection closed — cleanup complete");
}

// =============================================================================
// Tests
// =============================================================================
