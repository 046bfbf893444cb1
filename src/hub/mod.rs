// =============================================================================
// MarketDataHub — selection, switch-over, fan-out
// =============================================================================
//
// Phases: Idle → Seeding → Streaming → (SwitchingOut → Seeding → ...)
//
// Exactly one feed worker runs at a time. A switch bumps the epoch, stops the
// current worker and awaits it (which closes its connection) before the new
// selection is seeded and its worker spawned.
// =============================================================================

pub mod listeners;
mod ticker;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use listeners::{SeriesUpdate, Subscription};

use self::listeners::ListenerRegistry;
use self::ticker::TickerFeed;
use self::worker::{FeedWorker, Route};
use crate::clock::Clock;
use crate::error::FeedError;
use crate::history::{HistoricalSeeder, HistorySource};
use crate::market_data::{Candle, HistoricalCache};
use crate::runtime_config::RuntimeConfig;
use crate::stream::{ConnectionState, Transport};
use crate::types::{normalize_symbol, FeedMode, SeriesKey, Timeframe};

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HubPhase {
    #[default]
    Idle,
    Seeding,
    Streaming,
    SwitchingOut,
}

impl fmt::Display for HubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Seeding => write!(f, "Seeding"),
            Self::Streaming => write!(f, "Streaming"),
            Self::SwitchingOut => write!(f, "SwitchingOut"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HubStatus {
    pub phase: HubPhase,
    pub selection: Option<SeriesKey>,
    pub mode: FeedMode,
    pub connection: Option<ConnectionState>,
    /// Why the selection is running on synthetic data, if it is.
    pub degraded_reason: Option<String>,
    /// Ticker feeds that gave up, with the reason. Cleared when re-tracked.
    pub offline_tickers: BTreeMap<String, String>,
}

/// Copy of one series for consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    #[serde(flatten)]
    pub key: SeriesKey,
    pub synthetic: bool,
    pub candles: Vec<Candle>,
}

// =============================================================================
// Shared state
// =============================================================================

pub(crate) struct HubInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) seeder: HistoricalSeeder,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache: HistoricalCache,
    pub(crate) listeners: ListenerRegistry,
    /// Current epoch. Workers apply ticks only under the read lock and only
    /// while their epoch matches.
    pub(crate) gate: RwLock<u64>,
    pub(crate) status: watch::Sender<HubStatus>,
    /// Symbol whose series belong to the feed worker. Seeds for it are only
    /// inserted by the activation that claimed it.
    writer: Mutex<Option<String>>,
    tickers: Mutex<HashMap<String, TickerFeed>>,
}

impl HubInner {
    fn advance_epoch(&self) -> u64 {
        let mut gate = self.gate.write();
        *gate += 1;
        *gate
    }

    /// Seed every timeframe of `symbol` that is missing or stale (all of them
    /// when `force`). Returns why `selection` is synthetic, if it is.
    ///
    /// Only the activation path passes `selection`; it owns `symbol`. Any
    /// other caller drops its results if the symbol was claimed by a feed
    /// worker while the fetch was in flight.
    async fn ensure_seeded(
        &self,
        symbol: &str,
        force: bool,
        selection: Option<&SeriesKey>,
    ) -> Option<String> {
        let now = self.clock.now_ms();
        let mut stale = 0usize;
        let needed: Vec<Timeframe> = Timeframe::ALL
            .into_iter()
            .filter(|tf| {
                if force {
                    return true;
                }
                match self.cache.get(&SeriesKey::new(symbol, *tf)) {
                    None => true,
                    Some(series) if series.read().is_stale(now) => {
                        stale += 1;
                        true
                    }
                    Some(_) => false,
                }
            })
            .collect();

        let mut reason = None;
        if !needed.is_empty() {
            if stale > 0 {
                info!(symbol, stale, "refreshing stale cached series");
            }
            let seeded = self
                .seeder
                .seed_all(symbol, &needed, self.config.seed_count)
                .await;
            let writer = self.writer.lock();
            if selection.is_none() && writer.as_deref() == Some(symbol) {
                debug!(symbol, "symbol became active during seeding, keeping live series");
                return None;
            }
            for s in seeded {
                if selection == Some(s.series.key()) {
                    reason = s
                        .error
                        .as_ref()
                        .filter(|e| e.is_degrading())
                        .map(|e| e.to_string());
                }
                self.cache.insert(s.series);
            }
            drop(writer);
        }

        if reason.is_none() {
            if let Some(key) = selection {
                let synthetic = self
                    .cache
                    .get(key)
                    .is_some_and(|series| series.read().is_synthetic());
                if synthetic {
                    reason = Some(format!("cached {key} was built from synthetic data"));
                }
            }
        }
        reason
    }
}

struct ActiveFeed {
    key: SeriesKey,
    epoch: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveFeed {
    async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(selection = %self.key, epoch = self.epoch, "feed worker panicked");
            }
        }
    }
}

// =============================================================================
// MarketDataHub
// =============================================================================

pub struct MarketDataHub {
    inner: Arc<HubInner>,
    active: tokio::sync::Mutex<Option<ActiveFeed>>,
}

impl MarketDataHub {
    pub fn new(
        mut config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistorySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FeedError> {
        config.validate()?;
        let seeder = HistoricalSeeder::new(history, clock.clone(), config.series_capacity)
            .with_base_prices(config.base_prices.clone());
        let (status, _) = watch::channel(HubStatus::default());

        let inner = HubInner {
            config,
            transport,
            seeder,
            clock,
            cache: HistoricalCache::new(),
            listeners: ListenerRegistry::new(),
            gate: RwLock::new(0),
            status,
            writer: Mutex::new(None),
            tickers: Mutex::new(HashMap::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
            active: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Activate `(symbol, timeframe)`. A no-op when it is already active.
    pub async fn select_feed(&self, symbol: &str, timeframe: Timeframe) -> Result<HubStatus, FeedError> {
        let key = SeriesKey::new(normalize_symbol(symbol)?, timeframe);
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|a| a.key == key && !a.task.is_finished())
        {
            return Ok(self.status());
        }
        self.activate(&mut active, key, false).await
    }

    /// Tear down the current feed, then seed and stream `(symbol, timeframe)`.
    pub async fn switch_to(&self, symbol: &str, timeframe: Timeframe) -> Result<HubStatus, FeedError> {
        let key = SeriesKey::new(normalize_symbol(symbol)?, timeframe);
        let mut active = self.active.lock().await;
        self.activate(&mut active, key, false).await
    }

    async fn activate(
        &self,
        active: &mut Option<ActiveFeed>,
        key: SeriesKey,
        reseed: bool,
    ) -> Result<HubStatus, FeedError> {
        let inner = &self.inner;
        // From here on nothing from the previous worker is applied.
        let epoch = inner.advance_epoch();

        if let Some(old) = active.take() {
            info!(from = %old.key, to = %key, "switching feed");
            inner.status.send_modify(|s| s.phase = HubPhase::SwitchingOut);
            old.stop().await;
            inner.status.send_modify(|s| {
                s.phase = HubPhase::Idle;
                s.connection = Some(ConnectionState::Closed);
            });
        }

        *inner.writer.lock() = Some(key.symbol.clone());
        inner.status.send_modify(|s| {
            s.phase = HubPhase::Seeding;
            s.selection = Some(key.clone());
            s.mode = FeedMode::Live;
            s.connection = None;
            s.degraded_reason = None;
        });
        let synthetic_reason = inner.ensure_seeded(&key.symbol, reseed, Some(&key)).await;

        let route = Route::for_selection(&inner.config, key.timeframe);
        let (stop, stop_rx) = watch::channel(false);
        let worker = FeedWorker::new(
            inner.clone(),
            epoch,
            key.clone(),
            route,
            stop_rx,
            synthetic_reason.is_some(),
        );

        inner.status.send_modify(|s| {
            s.phase = HubPhase::Streaming;
            s.connection = Some(ConnectionState::Connecting);
            s.mode = if synthetic_reason.is_some() {
                FeedMode::Synthetic
            } else {
                FeedMode::Live
            };
            s.degraded_reason = synthetic_reason;
        });

        let task = tokio::spawn(worker.run());
        info!(selection = %key, ?route, epoch, "feed selected");
        *active = Some(ActiveFeed {
            key,
            epoch,
            stop,
            task,
        });
        Ok(self.status())
    }

    pub async fn active_selection(&self) -> Option<SeriesKey> {
        self.active.lock().await.as_ref().map(|a| a.key.clone())
    }

    // -------------------------------------------------------------------------
    // Cache management
    // -------------------------------------------------------------------------

    /// Seed every timeframe of `symbols` concurrently. Already cached, fresh
    /// series are kept.
    pub async fn preload(&self, symbols: &[String]) -> Result<(), FeedError> {
        let active = self.active_selection().await.map(|k| k.symbol);
        let mut wanted = Vec::with_capacity(symbols.len());
        for raw in symbols {
            let symbol = normalize_symbol(raw)?;
            if active.as_deref() == Some(symbol.as_str()) || wanted.contains(&symbol) {
                continue;
            }
            wanted.push(symbol);
        }

        join_all(
            wanted
                .iter()
                .map(|symbol| self.inner.ensure_seeded(symbol, false, None)),
        )
        .await;
        info!(symbols = ?wanted, series = self.inner.cache.len(), "historical cache preloaded");
        Ok(())
    }

    /// Re-seed every timeframe of `symbol`. The active symbol is restarted so
    /// the feed worker stays the only writer of its series.
    pub async fn refresh(&self, symbol: &str) -> Result<(), FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let mut active = self.active.lock().await;
        match active.as_ref().map(|a| a.key.clone()) {
            Some(key) if key.symbol == symbol => {
                self.activate(&mut active, key, true).await?;
            }
            _ => {
                drop(active);
                self.inner.ensure_seeded(&symbol, true, None).await;
            }
        }
        info!(symbol = %symbol, "series refreshed");
        Ok(())
    }

    /// Drop every cached series of a symbol that is not active.
    pub async fn evict(&self, symbol: &str) -> Result<usize, FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| a.key.symbol == symbol) {
            return Err(FeedError::InvalidSelection(format!(
                "cannot evict the active symbol {symbol}"
            )));
        }
        let removed = self.inner.cache.remove_symbol(&symbol);
        info!(symbol = %symbol, removed, "evicted cached series");
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SeriesUpdate) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn snapshot(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Candle>> {
        self.inner.cache.snapshot(&SeriesKey::new(symbol, timeframe))
    }

    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Option<SeriesSnapshot> {
        let key = SeriesKey::new(symbol, timeframe);
        let shared = self.inner.cache.get(&key)?;
        let series = shared.read();
        Some(SeriesSnapshot {
            key,
            synthetic: series.is_synthetic(),
            candles: series.snapshot(),
        })
    }

    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        self.inner.cache.latest(&SeriesKey::new(symbol, timeframe))
    }

    pub fn cached_keys(&self) -> Vec<SeriesKey> {
        let mut keys = self.inner.cache.keys();
        keys.sort_by(|a, b| (&a.symbol, a.timeframe).cmp(&(&b.symbol, b.timeframe)));
        keys
    }

    pub fn status(&self) -> HubStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<HubStatus> {
        self.inner.status.subscribe()
    }

    // -------------------------------------------------------------------------
    // Ticker feeds
    // -------------------------------------------------------------------------

    /// Start (or join) the ticker-only price feed of `symbol`. Must be called
    /// from within a Tokio runtime.
    pub fn track_ticker(&self, symbol: &str) -> Result<watch::Receiver<Option<f64>>, FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let mut tickers = self.inner.tickers.lock();
        if tickers.get(&symbol).is_some_and(TickerFeed::is_finished) {
            info!(symbol = %symbol, "restarting ticker feed that gave up");
            tickers.remove(&symbol);
        }
        let feed = tickers.entry(symbol.clone()).or_insert_with(|| {
            info!(symbol = %symbol, "tracking ticker");
            self.inner.status.send_if_modified(|s| s.offline_tickers.remove(&symbol).is_some());
            TickerFeed::start(
                &symbol,
                self.inner.transport.clone(),
                self.inner.config.reconnect_policy(),
                Arc::downgrade(&self.inner),
            )
        });
        Ok(feed.subscribe())
    }

    /// Stop the ticker feed of `symbol`. Returns false when it was not tracked.
    pub async fn untrack_ticker(&self, symbol: &str) -> bool {
        let Ok(symbol) = normalize_symbol(symbol) else {
            return false;
        };
        let removed = self.inner.tickers.lock().remove(&symbol);
        let tracked = match removed {
            Some(feed) => {
                feed.stop().await;
                info!(symbol = %symbol, "ticker untracked");
                true
            }
            None => false,
        };
        // After the stop, so a feed giving up concurrently cannot re-add it.
        self.inner
            .status
            .send_if_modified(|s| s.offline_tickers.remove(&symbol).is_some());
        tracked
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.inner.tickers.lock().get(&symbol)?.last_price()
    }

    /// Why the ticker feed of `symbol` stopped updating, if it did.
    pub fn ticker_offline_reason(&self, symbol: &str) -> Option<String> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.inner.status.borrow().offline_tickers.get(&symbol).cloned()
    }

    pub fn tracked_tickers(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.inner.tickers.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Close every connection, then drop all series and listeners.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        self.inner.advance_epoch();
        if let Some(old) = active.take() {
            old.stop().await;
        }
        *self.inner.writer.lock() = None;

        let tickers: Vec<TickerFeed> = self
            .inner
            .tickers
            .lock()
            .drain()
            .map(|(_, feed)| feed)
            .collect();
        join_all(tickers.into_iter().map(TickerFeed::stop)).await;

        self.inner.cache.clear();
        self.inner.listeners.clear();
        self.inner.status.send_replace(HubStatus::default());
        info!("market data hub shut down");
    }
}

impl Drop for MarketDataHub {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(feed) = active.take() {
                feed.stop.send_replace(true);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stream::MessageStream;
    use crate::types::FeedKey;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Start of an hour, so every bucket of the seeded history has just opened.
    const T0: i64 = 1_699_999_200_000;

    /// "A…" symbols trade near 1000, everything else near 2.
    fn base_for(symbol: &str) -> f64 {
        if symbol.starts_with('A') {
            1_000.0
        } else {
            2.0
        }
    }

    fn message_for(feed: &FeedKey, i: i64) -> String {
        let price = base_for(feed.symbol()) + i as f64 * 0.01;
        match feed {
            FeedKey::Kline { symbol, timeframe } => format!(
                r#"{{"e":"kline","s":"{symbol}","k":{{"t":{},"i":"{timeframe}","o":"{price}","h":"{price}","l":"{price}","c":"{price}","x":false}}}}"#,
                T0 + i * 1_000
            ),
            FeedKey::Ticker { symbol } => format!(
                r#"{{"e":"24hrTicker","E":{},"s":"{symbol}","c":"{price}"}}"#,
                T0 + i
            ),
        }
    }

    /// Endless 2 ms tick stream per feed, or refused connections.
    struct FakeExchange {
        refuse: AtomicBool,
        connects: AtomicU32,
    }

    impl FakeExchange {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                refuse: AtomicBool::new(refuse),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeExchange {
        async fn connect(&self, feed: &FeedKey) -> Result<MessageStream, FeedError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(FeedError::Transport {
                    feed: feed.to_string(),
                    reason: "connection refused".into(),
                });
            }
            let feed = feed.clone();
            Ok(Box::pin(stream::unfold(0i64, move |i| {
                let text = message_for(&feed, i);
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Some((Ok::<String, FeedError>(text), i + 1))
                }
            })))
        }
    }

    /// Flat history ending at the bucket of `T0`, or a 503.
    struct FakeHistory {
        fail: bool,
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn fetch(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, FeedError> {
            if self.fail {
                return Err(FeedError::SeedFetch {
                    key: SeriesKey::new(symbol, timeframe).to_string(),
                    reason: "503 Service Unavailable".into(),
                });
            }
            let last = timeframe.bucket_start(T0);
            let p = base_for(symbol);
            Ok((0..limit as i64)
                .rev()
                .map(|back| Candle::new(last - back * timeframe.width_ms(), p, p, p, p))
                .collect())
        }
    }

    /// Flat history whose fetches wait for `release` while `hold` is set.
    struct GatedHistory {
        hold: AtomicBool,
        waiting: AtomicUsize,
        release: watch::Sender<bool>,
    }

    #[async_trait]
    impl HistorySource for GatedHistory {
        async fn fetch(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, FeedError> {
            if self.hold.load(Ordering::SeqCst) {
                let mut open = self.release.subscribe();
                self.waiting.fetch_add(1, Ordering::SeqCst);
                let _ = open.wait_for(|open| *open).await;
            }
            FakeHistory { fail: false }.fetch(symbol, timeframe, limit).await
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            symbols: vec!["AAAUSDT".into(), "BBBUSDT".into()],
            default_symbol: "AAAUSDT".into(),
            seed_count: 10,
            reconnect_base_ms: 1,
            reconnect_max_delay_ms: 5,
            max_reconnect_attempts: 2,
            handshake_timeout_ms: 500,
            synthetic_tick_ms: 5,
            ..RuntimeConfig::default()
        }
    }

    fn hub_with(exchange: Arc<FakeExchange>, history_fails: bool, clock: ManualClock) -> MarketDataHub {
        MarketDataHub::new(
            config(),
            exchange,
            Arc::new(FakeHistory {
                fail: history_fails,
            }),
            Arc::new(clock),
        )
        .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn first_select_seeds_then_streams() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let status = hub.select_feed("aaausdt", Timeframe::Minute1).await.unwrap();

        assert_eq!(status.phase, HubPhase::Streaming);
        assert_eq!(status.selection, Some(SeriesKey::new("AAAUSDT", Timeframe::Minute1)));
        assert_eq!(status.mode, FeedMode::Live);
        assert_eq!(hub.cached_keys().len(), Timeframe::ALL.len());

        assert!(
            eventually(|| hub
                .latest("AAAUSDT", Timeframe::Minute1)
                .is_some_and(|c| c.close > 1_000.0))
            .await
        );
        assert!(eventually(|| hub.status().connection == Some(ConnectionState::Open)).await);

        let again = hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();
        assert_eq!(again.phase, HubPhase::Streaming);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn updates_reach_subscribers_with_full_snapshot() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let seen: Arc<Mutex<Vec<SeriesUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = hub.subscribe(move |u| sink.lock().push(u.clone()));

        hub.select_feed("AAAUSDT", Timeframe::Second1).await.unwrap();
        assert!(eventually(|| seen.lock().len() >= 5).await);

        let last = seen.lock().last().cloned().unwrap();
        assert_eq!(last.key, SeriesKey::new("AAAUSDT", Timeframe::Second1));
        assert_eq!(last.snapshot.last().copied(), Some(last.latest));
        assert!(last.snapshot.len() <= hub.config().series_capacity);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn derived_timeframes_are_aggregated_from_base_feed() {
        let exchange = FakeExchange::new(false);
        let hub = hub_with(exchange.clone(), false, ManualClock::new(T0));
        let derived = Arc::new(AtomicUsize::new(0));
        let d = derived.clone();
        let _sub = hub.subscribe(move |u| {
            if u.key.timeframe == Timeframe::Minute15 {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        hub.select_feed("AAAUSDT", Timeframe::Minute15).await.unwrap();
        assert!(eventually(|| derived.load(Ordering::SeqCst) > 3).await);

        // The seeded bucket is continued, not restarted.
        let latest = hub.latest("AAAUSDT", Timeframe::Minute15).unwrap();
        assert_eq!(latest.open, 1_000.0);
        assert!(latest.high > 1_000.0);
        assert_eq!(exchange.connects.load(Ordering::SeqCst), 1);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn switch_never_applies_old_feed_after_it_begins() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let seen: Arc<Mutex<Vec<SeriesKey>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = hub.subscribe(move |u| sink.lock().push(u.key.clone()));

        hub.switch_to("AAAUSDT", Timeframe::Minute1).await.unwrap();
        assert!(eventually(|| seen.lock().len() > 10).await);

        hub.switch_to("BBBUSDT", Timeframe::Second1).await.unwrap();
        let cutoff = seen.lock().len();
        let frozen_a = hub.snapshot("AAAUSDT", Timeframe::Minute1).unwrap();

        assert!(eventually(|| seen.lock().len() > cutoff + 10).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(seen.lock()[cutoff..].iter().all(|k| k.symbol == "BBBUSDT"));
        assert_eq!(hub.snapshot("AAAUSDT", Timeframe::Minute1).unwrap(), frozen_a);
        for tf in Timeframe::ALL {
            let b = hub.snapshot("BBBUSDT", tf).unwrap();
            assert!(b.iter().all(|c| c.close < 10.0), "A-origin candle in BBBUSDT@{tf}");
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_feed_degrades_and_series_keeps_growing() {
        let exchange = FakeExchange::new(true);
        let hub = hub_with(exchange.clone(), false, ManualClock::stepping(T0, 60_000));
        let status = hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();
        assert_eq!(status.mode, FeedMode::Live);

        assert!(eventually(|| hub.status().mode == FeedMode::Synthetic).await);
        let status = hub.status();
        assert!(status
            .degraded_reason
            .as_deref()
            .is_some_and(|r| r.contains("gave up")));
        assert_eq!(exchange.connects.load(Ordering::SeqCst), 2);

        let len_at_degrade = hub.snapshot("AAAUSDT", Timeframe::Minute1).unwrap().len();
        assert!(
            eventually(|| hub.snapshot("AAAUSDT", Timeframe::Minute1).unwrap().len()
                > len_at_degrade + 2)
            .await
        );
        let series = hub.series("AAAUSDT", Timeframe::Minute1).unwrap();
        assert!(series.synthetic);
        assert!(series.candles.last().unwrap().synthetic);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn synthetic_seed_reports_degraded_until_live_ticks() {
        let hub = hub_with(FakeExchange::new(false), true, ManualClock::new(T0));
        let status = hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();

        assert_eq!(status.mode, FeedMode::Synthetic);
        assert!(status
            .degraded_reason
            .as_deref()
            .is_some_and(|r| r.contains("history")));
        assert!(hub.series("AAAUSDT", Timeframe::Minute1).unwrap().synthetic);

        assert!(eventually(|| hub.status().mode == FeedMode::Live).await);
        assert_eq!(hub.status().degraded_reason, None);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn removed_listener_receives_nothing_further() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = hub.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        hub.select_feed("AAAUSDT", Timeframe::Second1).await.unwrap();
        assert!(eventually(|| hits.load(Ordering::SeqCst) > 0).await);

        sub.unsubscribe();
        let after = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after);
        hub.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribe_and_unsubscribe_while_streaming() {
        let hub = Arc::new(hub_with(FakeExchange::new(false), false, ManualClock::new(T0)));
        hub.select_feed("AAAUSDT", Timeframe::Second1).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut kept = None;
                for i in 0..50 {
                    let sub = hub.subscribe(|_| {});
                    if i == 49 {
                        kept = Some(sub);
                    }
                    tokio::task::yield_now().await;
                }
                kept
            }));
        }
        let mut kept = Vec::new();
        for t in tasks {
            kept.push(t.await.unwrap());
        }

        assert_eq!(hub.listener_count(), 8);
        drop(kept);
        assert_eq!(hub.listener_count(), 0);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn evict_refuses_active_symbol() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        hub.preload(&["aaausdt".to_string(), "BBBUSDT".to_string()])
            .await
            .unwrap();
        assert_eq!(hub.cached_keys().len(), 2 * Timeframe::ALL.len());

        hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();
        assert!(matches!(
            hub.evict("AAAUSDT").await,
            Err(FeedError::InvalidSelection(_))
        ));
        assert_eq!(hub.evict("bbbusdt").await.unwrap(), Timeframe::ALL.len());
        assert!(hub.snapshot("BBBUSDT", Timeframe::Minute1).is_none());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_restarts_active_symbol() {
        let exchange = FakeExchange::new(false);
        let hub = hub_with(exchange.clone(), false, ManualClock::new(T0));
        hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();
        assert!(eventually(|| exchange.connects.load(Ordering::SeqCst) == 1).await);

        hub.refresh("AAAUSDT").await.unwrap();
        assert!(eventually(|| exchange.connects.load(Ordering::SeqCst) == 2).await);
        assert_eq!(hub.status().phase, HubPhase::Streaming);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn ticker_tracks_last_price() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let mut rx = hub.track_ticker("bbbusdt").unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().is_some_and(|p| p >= 2.0));
        assert!(hub.last_price("BBBUSDT").is_some());
        assert_eq!(hub.tracked_tickers(), vec!["BBBUSDT".to_string()]);

        assert!(hub.untrack_ticker("BBBUSDT").await);
        assert!(!hub.untrack_ticker("BBBUSDT").await);
        assert_eq!(hub.last_price("BBBUSDT"), None);
        hub.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_racing_a_selection_keeps_the_live_series() {
        let (release, _) = watch::channel(false);
        let history = Arc::new(GatedHistory {
            hold: AtomicBool::new(true),
            waiting: AtomicUsize::new(0),
            release,
        });
        let hub = Arc::new(
            MarketDataHub::new(
                config(),
                FakeExchange::new(false),
                history.clone(),
                Arc::new(ManualClock::new(T0)),
            )
            .unwrap(),
        );

        let refresh = tokio::spawn({
            let hub = hub.clone();
            async move { hub.refresh("AAAUSDT").await }
        });
        assert!(eventually(|| history.waiting.load(Ordering::SeqCst) == Timeframe::ALL.len()).await);
        history.hold.store(false, Ordering::SeqCst);

        hub.select_feed("AAAUSDT", Timeframe::Second1).await.unwrap();
        assert!(
            eventually(|| hub
                .snapshot("AAAUSDT", Timeframe::Second1)
                .is_some_and(|s| s.len() >= 60))
            .await
        );

        // The held fetches complete after the worker owns the symbol.
        history.release.send_replace(true);
        refresh.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let series = hub.series("AAAUSDT", Timeframe::Second1).unwrap();
        assert!(series.candles.len() >= 60);
        assert!(!series.synthetic);
        assert_eq!(hub.status().phase, HubPhase::Streaming);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_ticker_is_reported_and_can_be_restarted() {
        let exchange = FakeExchange::new(true);
        let hub = hub_with(exchange.clone(), false, ManualClock::new(T0));
        hub.track_ticker("BBBUSDT").unwrap();

        assert!(eventually(|| hub.status().offline_tickers.contains_key("BBBUSDT")).await);
        assert!(hub
            .ticker_offline_reason("bbbusdt")
            .is_some_and(|r| r.contains("gave up")));
        assert_eq!(exchange.connects.load(Ordering::SeqCst), 2);
        assert_eq!(hub.last_price("BBBUSDT"), None);

        // Tracking again replaces the finished feed instead of joining it.
        exchange.refuse.store(false, Ordering::SeqCst);
        assert!(
            eventually(|| {
                let _ = hub.track_ticker("BBBUSDT");
                exchange.connects.load(Ordering::SeqCst) > 2
            })
            .await
        );
        assert!(eventually(|| hub.last_price("BBBUSDT").is_some()).await);
        assert!(hub.status().offline_tickers.is_empty());
        assert_eq!(hub.ticker_offline_reason("BBBUSDT"), None);
        assert_eq!(hub.tracked_tickers(), vec!["BBBUSDT".to_string()]);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        let _sub = hub.subscribe(|_| {});
        hub.select_feed("AAAUSDT", Timeframe::Minute1).await.unwrap();
        hub.track_ticker("AAAUSDT").unwrap();

        hub.shutdown().await;
        assert_eq!(hub.status(), HubStatus::default());
        assert!(hub.cached_keys().is_empty());
        assert_eq!(hub.listener_count(), 0);
        assert!(hub.tracked_tickers().is_empty());
        assert_eq!(hub.active_selection().await, None);
    }

    #[tokio::test]
    async fn invalid_symbol_is_rejected() {
        let hub = hub_with(FakeExchange::new(false), false, ManualClock::new(T0));
        assert!(matches!(
            hub.switch_to("btc/usdt", Timeframe::Minute1).await,
            Err(FeedError::InvalidSelection(_))
        ));
        assert_eq!(hub.status().phase, HubPhase::Idle);
    }
}
