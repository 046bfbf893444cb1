pub mod connection;
pub mod message;
pub mod transport;

pub use connection::{ConnectionState, ReconnectPolicy, StreamConnection, StreamEvent};
pub use message::{parse_feed_message, Tick};
pub use transport::{MessageStream, Transport, WsTransport};
