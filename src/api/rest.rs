// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads come straight from the hub's
// cache as copies; the only writes are feed selection, ticker tracking and
// cache maintenance, each of which goes through the hub.
//
// CORS is configured permissively; the charts are served from another origin.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::FeedError;
use crate::types::{normalize_symbol, Timeframe};

type ApiError = (StatusCode, Json<serde_json::Value>);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        // ── Series ──────────────────────────────────────────────────
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/feed", post(select_feed))
        .route("/api/v1/cache", get(cached_series))
        .route("/api/v1/cache/:symbol", delete(evict_symbol))
        .route("/api/v1/cache/:symbol/refresh", post(refresh_symbol))
        // ── Ticker-only price feeds ─────────────────────────────────
        .route(
            "/api/v1/ticker/:symbol",
            get(ticker_price).post(track_ticker).delete(untrack_ticker),
        )
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Map a hub error to an HTTP status and a JSON body.
fn feed_error(err: FeedError) -> ApiError {
    let code = match &err {
        FeedError::InvalidSelection(_) | FeedError::Config(_) => StatusCode::BAD_REQUEST,
        FeedError::Transport { .. }
        | FeedError::ExhaustedRetries { .. }
        | FeedError::SeedFetch { .. } => StatusCode::BAD_GATEWAY,
        FeedError::MalformedMessage(_) | FeedError::OutOfOrderTick { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (code, Json(json!({ "error": err.to_string() })))
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Deserialize)]
struct CandleQuery {
    symbol: String,
    timeframe: String,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let timeframe = Timeframe::from_str(&query.timeframe).map_err(feed_error)?;
    let symbol = normalize_symbol(&query.symbol).map_err(feed_error)?;

    state
        .hub
        .series(&symbol, timeframe)
        .map(Json)
        .ok_or_else(|| not_found(format!("{symbol}@{timeframe} is not cached")))
}

#[derive(Deserialize)]
struct FeedRequest {
    symbol: String,
    timeframe: String,
}

async fn select_feed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FeedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let timeframe = Timeframe::from_str(&req.timeframe).map_err(feed_error)?;
    let status = state
        .hub
        .select_feed(&req.symbol, timeframe)
        .await
        .map_err(feed_error)?;
    info!(symbol = %req.symbol, timeframe = %timeframe, mode = %status.mode, "feed selected via API");
    Ok(Json(status))
}

// =============================================================================
// Cache maintenance
// =============================================================================

async fn cached_series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.cached_keys())
}

async fn refresh_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.hub.refresh(&symbol).await.map_err(feed_error)?;
    Ok(Json(json!({
        "symbol": symbol.to_uppercase(),
        "status": state.hub.status(),
    })))
}

async fn evict_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.hub.evict(&symbol).await.map_err(feed_error)?;
    Ok(Json(json!({
        "symbol": symbol.to_uppercase(),
        "removed": removed,
    })))
}

// =============================================================================
// Tickers
// =============================================================================

#[derive(Serialize)]
struct TickerResponse {
    symbol: String,
    price: Option<f64>,
    offline: Option<String>,
}

async fn ticker_price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(feed_error)?;
    if !state.hub.tracked_tickers().contains(&symbol) {
        return Err(not_found(format!("{symbol} is not tracked")));
    }
    Ok(Json(TickerResponse {
        price: state.hub.last_price(&symbol),
        offline: state.hub.ticker_offline_reason(&symbol),
        symbol,
    }))
}

async fn track_ticker(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(feed_error)?;
    let price = state.hub.track_ticker(&symbol).map_err(feed_error)?;
    let price = *price.borrow();
    Ok((
        StatusCode::CREATED,
        Json(TickerResponse {
            offline: state.hub.ticker_offline_reason(&symbol),
            symbol,
            price,
        }),
    ))
}

async fn untrack_ticker(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.hub.untrack_ticker(&symbol).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        warn!(symbol = %symbol, "untrack requested for an untracked ticker");
        Err(not_found(format!("{} is not tracked", symbol.to_uppercase())))
    }
}

// =============================================================================
// Tests
// =============================================================================
