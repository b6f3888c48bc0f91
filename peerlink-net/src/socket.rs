//! The physical relay connection, seen as two halves of text messages.

use std::pin::Pin;

use futures_util::{Sink, Stream};

/// Write half: one JSON text message per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SocketError> + Send>>;

/// Read half. Ends when the relay closes the connection.
pub type FrameSource = Pin<Box<dyn Stream<Item = Result<String, SocketError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("websocket error: {source}")]
    WebSocket {
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("invalid relay request: {source}")]
    Request {
        #[source]
        source: eyre::Error,
    },

    #[error("TLS configuration error: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("timed out connecting to {url}")]
    Timeout { url: String },

    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay connection closed")]
    Closed,
}

/// Opens physical connections to the relay.
///
/// Every call to [`Dialer::dial`] is a fresh connection attempt; callers are
/// responsible for not dialing twice concurrently.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<(FrameSink, FrameSource), SocketError>;
}
