use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::error::FeedError;
use crate::types::FeedKey;

/// Text frames of one open socket. The stream ends when the peer closes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String, FeedError>> + Send>>;

/// Opens one physical streaming connection per call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, feed: &FeedKey) -> Result<MessageStream, FeedError>;
}

/// WebSocket transport against `{base_url}/{stream_name}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, feed: &FeedKey) -> String {
        format!("{}/{}", self.base_url, feed.stream_name())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, feed: &FeedKey) -> Result<MessageStream, FeedError> {
        let url = self.url_for(feed);
        info!(url = %url, feed = %feed, "connecting to feed WebSocket");

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| FeedError::Transport {
                feed: feed.to_string(),
                reason: e.to_string(),
            })?;

        let name = feed.to_string();
        // Ping/Pong are answered by tungstenite; only payload frames go up.
        let frames = ws_stream.filter_map(move |msg| {
            let out = match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).map_err(|e| {
                    FeedError::MalformedMessage(format!("non-UTF-8 binary frame: {e}"))
                })),
                Ok(Message::Close(frame)) => {
                    debug!(feed = %name, ?frame, "close frame received");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::Transport {
                    feed: name.clone(),
                    reason: e.to_string(),
                })),
            };
            future::ready(out)
        });

        Ok(Box::pin(frames))
    }
}
