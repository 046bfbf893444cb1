// =============================================================================
// Feed worker — the single writer for the active selection
// =============================================================================
//
// Every mutation of a series happens here, under the hub's gate read lock and
// only while the worker's epoch is current. `switch_to` bumps the epoch under
// the write lock before it tears the worker down, so a message already in
// flight from the old feed is dropped instead of applied.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listeners::SeriesUpdate;
use super::{HubInner, HubStatus};
use crate::clock::Clock;
use crate::error::FeedError;
use crate::market_data::{Candle, CandleSeries, SyntheticTicker, TimeframeAggregator};
use crate::runtime_config::RuntimeConfig;
use crate::stream::connection::wait_shutdown;
use crate::stream::{ConnectionState, StreamConnection, StreamEvent, Tick};
use crate::types::{FeedKey, FeedMode, SeriesKey, Timeframe};

const EVENT_BUFFER: usize = 256;

/// How ticks reach the selected series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// The exchange streams this timeframe; ticks upsert it directly.
    Direct(Timeframe),
    /// Ticks arrive on `base` and coarser series are aggregated from them.
    Derived { base: Timeframe },
}

impl Route {
    pub(crate) fn for_selection(config: &RuntimeConfig, timeframe: Timeframe) -> Self {
        if config.is_native(timeframe) {
            Self::Direct(timeframe)
        } else {
            Self::Derived {
                base: config.base_timeframe,
            }
        }
    }

    pub(crate) fn stream_timeframe(self) -> Timeframe {
        match self {
            Self::Direct(tf) => tf,
            Self::Derived { base } => base,
        }
    }
}

pub(crate) struct FeedWorker {
    hub: Arc<HubInner>,
    epoch: u64,
    selection: SeriesKey,
    route: Route,
    aggregator: Option<TimeframeAggregator>,
    stop: watch::Receiver<bool>,
    /// Mode is synthetic because of the seed; the first live tick clears it.
    awaiting_live: bool,
}

impl FeedWorker {
    pub(crate) fn new(
        hub: Arc<HubInner>,
        epoch: u64,
        selection: SeriesKey,
        route: Route,
        stop: watch::Receiver<bool>,
        awaiting_live: bool,
    ) -> Self {
        let aggregator = match route {
            Route::Direct(_) => None,
            Route::Derived { base } => {
                let targets = hub.cache.timeframes_of(&selection.symbol);
                let mut agg = TimeframeAggregator::new(base, targets);
                let primed: Vec<Timeframe> = agg.targets().collect();
                for tf in primed {
                    let key = SeriesKey::new(&selection.symbol, tf);
                    if let Some(latest) = hub.cache.latest(&key) {
                        agg.prime(tf, latest);
                    }
                }
                Some(agg)
            }
        };

        Self {
            hub,
            epoch,
            selection,
            route,
            aggregator,
            stop,
            awaiting_live,
        }
    }

    pub(crate) async fn run(mut self) {
        let feed = FeedKey::kline(&self.selection.symbol, self.route.stream_timeframe());
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut connection = Some(StreamConnection::open(
            feed.clone(),
            self.hub.transport.clone(),
            self.hub.config.reconnect_policy(),
            tx.clone(),
        ));
        let mut synthetic: Option<JoinHandle<()>> = None;

        info!(
            selection = %self.selection,
            feed = %feed,
            route = ?self.route,
            epoch = self.epoch,
            "feed worker started"
        );

        loop {
            let event = tokio::select! {
                _ = wait_shutdown(&mut self.stop) => break,
                event = rx.recv() => event,
            };
            match event {
                Some(StreamEvent::Tick(tick)) => self.apply(&tick),
                Some(StreamEvent::Opened) => {
                    self.update_status(|s| s.connection = Some(ConnectionState::Open));
                }
                Some(StreamEvent::Reconnecting { attempt, delay }) => {
                    debug!(feed = %feed, attempt, delay_ms = delay.as_millis() as u64, "feed reconnecting");
                    self.update_status(|s| s.connection = Some(ConnectionState::Reconnecting));
                }
                Some(StreamEvent::Exhausted(err)) => {
                    if let Some(mut conn) = connection.take() {
                        conn.close().await;
                    }
                    if synthetic.is_none() {
                        synthetic = Some(self.degrade(err, tx.clone()));
                    }
                }
                None => break,
            }
        }

        if let Some(mut conn) = connection {
            conn.close().await;
        }
        if let Some(task) = synthetic {
            task.abort();
            let _ = task.await;
        }
        debug!(selection = %self.selection, epoch = self.epoch, "feed worker stopped");
    }

    /// Apply one tick if this worker is still current.
    fn apply(&mut self, tick: &Tick) {
        let hub = self.hub.clone();
        let gate = hub.gate.read();
        if *gate != self.epoch {
            debug!(
                selection = %self.selection,
                epoch = self.epoch,
                current = *gate,
                "dropping tick from superseded feed"
            );
            return;
        }

        let candle = tick.to_candle();
        self.upsert_and_notify(self.route.stream_timeframe(), candle);

        let derived = self
            .aggregator
            .as_mut()
            .map(|agg| agg.push(&candle))
            .unwrap_or_default();
        for (tf, bucket) in derived {
            self.upsert_and_notify(tf, bucket);
        }

        if self.awaiting_live && !tick.synthetic {
            self.awaiting_live = false;
            info!(selection = %self.selection, "live data arrived, leaving synthetic mode");
            hub.status.send_modify(|s| {
                s.mode = FeedMode::Live;
                s.degraded_reason = None;
            });
        }
        drop(gate);
    }

    fn upsert_and_notify(&self, timeframe: Timeframe, candle: Candle) {
        let key = SeriesKey {
            symbol: self.selection.symbol.clone(),
            timeframe,
        };
        let capacity = self.hub.config.series_capacity;
        let shared = self
            .hub
            .cache
            .get_or_insert_with(&key, || CandleSeries::new(key.clone(), capacity));

        let update = {
            let mut series = shared.write();
            if let Err(e) = series.upsert(candle) {
                debug!(error = %e, "discarded update");
                return;
            }
            if candle.synthetic {
                series.mark_synthetic();
            }
            let Some(latest) = series.latest() else {
                return;
            };
            SeriesUpdate {
                key,
                latest,
                snapshot: Arc::new(series.snapshot()),
                synthetic: series.is_synthetic(),
            }
        };
        self.hub.listeners.notify(&update);
    }

    /// Replace the exhausted connection with a synthetic ticker.
    fn degrade(&mut self, err: FeedError, tx: mpsc::Sender<StreamEvent>) -> JoinHandle<()> {
        let stream_tf = self.route.stream_timeframe();
        let stream_key = SeriesKey::new(&self.selection.symbol, stream_tf);
        let start = self
            .hub
            .cache
            .latest(&stream_key)
            .map(|c| c.close)
            .unwrap_or_else(|| self.hub.seeder.base_price(&self.selection.symbol));

        warn!(
            selection = %self.selection,
            error = %err,
            start_price = start,
            "feed exhausted, switching to synthetic ticks"
        );

        {
            let gate = self.hub.gate.read();
            if *gate == self.epoch {
                for key in [&stream_key, &self.selection] {
                    if let Some(series) = self.hub.cache.get(key) {
                        series.write().mark_synthetic();
                    }
                }
                self.hub.status.send_modify(|s| {
                    s.mode = FeedMode::Synthetic;
                    s.connection = Some(ConnectionState::Closed);
                    s.degraded_reason = Some(err.to_string());
                });
            }
        }
        self.awaiting_live = false;

        tokio::spawn(synthetic_stream(
            self.selection.symbol.clone(),
            stream_tf,
            start,
            self.hub.clock.clone(),
            self.hub.config.synthetic_tick(),
            tx,
            self.stop.clone(),
        ))
    }

    fn update_status(&self, modify: impl FnOnce(&mut HubStatus)) {
        let gate = self.hub.gate.read();
        if *gate == self.epoch {
            self.hub.status.send_modify(modify);
        }
    }
}

/// Random-walk ticks stamped by `clock`, one per `interval`.
async fn synthetic_stream(
    symbol: String,
    timeframe: Timeframe,
    start_price: f64,
    clock: Arc<dyn Clock>,
    interval: Duration,
    tx: mpsc::Sender<StreamEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = SyntheticTicker::new(&symbol, timeframe, start_price);
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut stop) => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let tick = Tick::price(symbol.clone(), clock.now_ms(), ticker.next_price(), true);
        if tx.send(StreamEvent::Tick(tick)).await.is_err() {
            break;
        }
    }
}
