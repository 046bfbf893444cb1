use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::HubInner;
use crate::stream::connection::wait_shutdown;
use crate::stream::{ReconnectPolicy, StreamConnection, StreamEvent, Transport};
use crate::types::FeedKey;

/// Ticker-only price feed for one symbol; publishes the last traded price.
///
/// When the connection gives up the task ends, the last price is kept and the
/// symbol is listed in the hub's `offline_tickers` until it is tracked again.
pub(crate) struct TickerFeed {
    price: watch::Receiver<Option<f64>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TickerFeed {
    pub(crate) fn start(
        symbol: &str,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        hub: Weak<HubInner>,
    ) -> Self {
        let (publish, price) = watch::channel(None);
        let (stop, mut stop_rx) = watch::channel(false);
        let feed = FeedKey::ticker(symbol);
        let symbol = feed.symbol().to_string();

        let task = tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(64);
            let mut conn = StreamConnection::open(feed.clone(), transport, policy, tx);
            info!(feed = %feed, "ticker feed started");

            loop {
                let event = tokio::select! {
                    _ = wait_shutdown(&mut stop_rx) => break,
                    event = rx.recv() => event,
                };
                match event {
                    Some(StreamEvent::Tick(tick)) => {
                        publish.send_replace(Some(tick.close));
                    }
                    Some(StreamEvent::Exhausted(e)) => {
                        warn!(feed = %feed, error = %e, "ticker feed gave up, last price kept");
                        if let Some(hub) = hub.upgrade() {
                            hub.status.send_modify(|s| {
                                s.offline_tickers.insert(symbol.clone(), e.to_string());
                            });
                        }
                        break;
                    }
                    Some(other) => debug!(feed = %feed, event = ?other, "ticker connection event"),
                    None => break,
                }
            }

            conn.close().await;
        });

        Self { price, stop, task }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<f64>> {
        self.price.clone()
    }

    pub(crate) fn last_price(&self) -> Option<f64> {
        *self.price.borrow()
    }

    /// The feed gave up (or was stopped) and no longer updates its price.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("ticker task panicked");
            }
        }
    }
}
