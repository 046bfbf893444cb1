// =============================================================================
// candle-hub — Main Entry Point
// =============================================================================
//
// Startup order: config, hub, historical preload, default feed, ticker feeds,
// then the API server. Ctrl+C closes every feed before the config is saved.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_hub::api;
use candle_hub::app_state::AppState;
use candle_hub::clock::SystemClock;
use candle_hub::history::RestHistorySource;
use candle_hub::stream::WsTransport;
use candle_hub::{MarketDataHub, RuntimeConfig};

const DEFAULT_CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candle-hub — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("FEED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let persisted = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    // Environment overrides apply to this run only and are never saved.
    let mut config = persisted.clone();
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate().context("invalid feed configuration")?;

    info!(
        symbols = ?config.symbols,
        default = %format!("{}@{}", config.default_symbol, config.default_timeframe),
        base = %config.base_timeframe,
        "Configured feeds"
    );

    // ── 2. Build the hub ─────────────────────────────────────────────────
    let transport = Arc::new(WsTransport::new(config.stream_url.clone()));
    let history = Arc::new(RestHistorySource::new(
        config.history_url.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?);
    let hub = Arc::new(MarketDataHub::new(
        config.clone(),
        transport,
        history,
        Arc::new(SystemClock),
    )?);
    let state = Arc::new(AppState::new(hub.clone()));
    let recorder = state.spawn_status_recorder();

    // ── 3. Seed the cache and start the default feed ─────────────────────
    if let Err(e) = hub.preload(&config.symbols).await {
        warn!(error = %e, "Historical preload failed");
    }
    let status = hub
        .select_feed(&config.default_symbol, config.default_timeframe)
        .await
        .context("failed to select the default feed")?;
    info!(phase = %status.phase, mode = %status.mode, "Default feed active");

    for symbol in &config.ticker_symbols {
        if let Err(e) = hub.track_ticker(symbol) {
            warn!(symbol = %symbol, error = %e, "Skipping ticker feed");
        }
    }

    // ── 4. Start the API server ──────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received — stopping gracefully");
        })
        .await
        .context("API server failed")?;

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    hub.shutdown().await;
    recorder.abort();

    if let Err(e) = persisted.save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("candle-hub shut down complete.");
    Ok(())
}
