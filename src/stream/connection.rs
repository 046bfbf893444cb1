// =============================================================================
// StreamConnection — one socket, one feed, reconnect/backoff state machine
// =============================================================================
//
// Connecting ──handshake ok──► Open ──peer closed / error──► Reconnecting
//     ▲                                                          │
//     └──────────────────── backoff elapsed ◄────────────────────┘
//
// A failed handshake also lands in Reconnecting. After `max_attempts`
// consecutive failed handshakes the driver stops in Closed and reports
// `ExhaustedRetries`. `close()` goes to Closed from any state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{parse_feed_message, Tick};
use super::transport::Transport;
use crate::error::FeedError;
use crate::types::FeedKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

/// What a connection reports to its sink.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Opened,
    Tick(Tick),
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the driver has stopped.
    Exhausted(FeedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            handshake_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    /// `base × attempt`, clamped to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// Handle to one running connection driver.
pub struct StreamConnection {
    feed: FeedKey,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Spawn the driver for `feed`. Events go to `sink` in transport order.
    pub fn open(
        feed: FeedKey,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            feed: feed.clone(),
            transport,
            policy,
            state: state.clone(),
            sink,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            feed,
            state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn feed(&self) -> &FeedKey {
        &self.feed
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Stop the driver and wait for it to exit. A pending reconnect timer is
    /// cancelled. Calling this more than once is a no-op.
    pub async fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            *self.state.write() = ConnectionState::Closing;
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(feed = %self.feed, "connection driver panicked");
                }
            }
            info!(feed = %self.feed, "connection closed");
        }
        *self.state.write() = ConnectionState::Closed;
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolves once shutdown is requested or the handle is gone.
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum PumpEnd {
    Lost,
    Shutdown,
}

struct Driver {
    feed: FeedKey,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    sink: mpsc::Sender<StreamEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut backoff: Option<(u32, Duration)> = None;

        loop {
            if let Some((attempt, delay)) = backoff.take() {
                self.set_state(ConnectionState::Reconnecting);
                info!(
                    feed = %self.feed,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after backoff"
                );
                if !self.emit(StreamEvent::Reconnecting { attempt, delay }).await {
                    break;
                }
                tokio::select! {
                    _ = wait_shutdown(&mut self.shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ConnectionState::Connecting);
            let connect = tokio::time::timeout(
                self.policy.handshake_timeout,
                self.transport.connect(&self.feed),
            );
            let outcome = tokio::select! {
                _ = wait_shutdown(&mut self.shutdown) => break,
                outcome = connect => outcome,
            };

            let stream = match outcome {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(feed = %self.feed, failures, error = %e, "feed connection failed");
                    if self.exhausted(failures).await {
                        return;
                    }
                    backoff = Some((failures, self.policy.delay_for(failures)));
                    continue;
                }
                Err(_) => {
                    failures += 1;
                    warn!(
                        feed = %self.feed,
                        failures,
                        timeout_ms = self.policy.handshake_timeout.as_millis() as u64,
                        "feed handshake timed out"
                    );
                    if self.exhausted(failures).await {
                        return;
                    }
                    backoff = Some((failures, self.policy.delay_for(failures)));
                    continue;
                }
            };

            failures = 0;
            self.set_state(ConnectionState::Open);
            info!(feed = %self.feed, "feed connected");
            if !self.emit(StreamEvent::Opened).await {
                break;
            }

            match self.pump(stream).await {
                PumpEnd::Shutdown => break,
                PumpEnd::Lost => backoff = Some((1, self.policy.delay_for(1))),
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!(feed = %self.feed, "connection driver stopped");
    }

    async fn pump(&mut self, mut stream: super::transport::MessageStream) -> PumpEnd {
        loop {
            let next = tokio::select! {
                _ = wait_shutdown(&mut self.shutdown) => return PumpEnd::Shutdown,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(text)) => match parse_feed_message(&self.feed, &text) {
                    Ok(Some(tick)) => {
                        if !self.emit(StreamEvent::Tick(tick)).await {
                            return PumpEnd::Shutdown;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(feed = %self.feed, error = %e, "dropping feed message"),
                },
                Some(Err(e)) => {
                    warn!(feed = %self.feed, error = %e, "feed read error");
                    return PumpEnd::Lost;
                }
                None => {
                    warn!(feed = %self.feed, "feed stream ended");
                    return PumpEnd::Lost;
                }
            }
        }
    }

    /// Report exhaustion once the budget is spent. Returns true when the
    /// driver must stop.
    async fn exhausted(&mut self, failures: u32) -> bool {
        if failures < self.policy.max_attempts {
            return false;
        }
        self.set_state(ConnectionState::Closed);
        warn!(feed = %self.feed, attempts = failures, "reconnect budget exhausted");
        let err = FeedError::ExhaustedRetries {
            feed: self.feed.to_string(),
            attempts: failures,
        };
        self.emit(StreamEvent::Exhausted(err)).await;
        true
    }

    /// Deliver one event unless shutdown wins first. False means stop.
    async fn emit(&mut self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            _ = wait_shutdown(&mut self.shutdown) => false,
            sent = self.sink.send(event) => sent.is_ok(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write() = next;
    }
}
