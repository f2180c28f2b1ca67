//! Byte transports.
//!
//! A connector establishes one connection and sends the initial request on
//! it; it never retries — failure handling belongs to the session layer.
//! Inbound data is a lazy sequence of text lines consumed by the session
//! task. Aborting an in-flight open resolves it to
//! [`TransportError::Aborted`] without a connected side effect.

pub mod http;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use pushlink_core::Request;

use crate::status::ClientStatus;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The open was aborted by its cancellation token.
    #[error("connection open aborted")]
    Aborted,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("bad server address: {0}")]
    BadAddress(String),
    /// The server answered the request with a non-success HTTP status.
    #[error("request refused: {0}")]
    Rejected(String),
}

/// One of the four concrete transport flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WsStreaming,
    WsPolling,
    HttpStreaming,
    HttpPolling,
}

impl TransportKind {
    pub fn is_ws(&self) -> bool {
        matches!(self, TransportKind::WsStreaming | TransportKind::WsPolling)
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, TransportKind::WsPolling | TransportKind::HttpPolling)
    }

    /// The polling flavor on the same protocol; stream-sense falls back to
    /// this when streaming stays silent.
    pub fn polling_variant(&self) -> TransportKind {
        match self {
            TransportKind::WsStreaming | TransportKind::WsPolling => TransportKind::WsPolling,
            TransportKind::HttpStreaming | TransportKind::HttpPolling => TransportKind::HttpPolling,
        }
    }

    /// The streaming flavor on the other protocol; the session manager
    /// switches to this when a transport cannot carry the session at all.
    pub fn alternate_protocol(&self) -> TransportKind {
        if self.is_ws() {
            TransportKind::HttpStreaming
        } else {
            TransportKind::WsStreaming
        }
    }

    /// The status to surface once this transport is proven to carry data.
    pub fn connected_status(&self) -> ClientStatus {
        match self {
            TransportKind::WsStreaming => ClientStatus::WsStreaming,
            TransportKind::WsPolling => ClientStatus::WsPolling,
            TransportKind::HttpStreaming => ClientStatus::HttpStreaming,
            TransportKind::HttpPolling => ClientStatus::HttpPolling,
        }
    }
}

/// One live connection carrying the session conversation.
#[async_trait]
pub trait StreamConnection: Send {
    /// Send a request on this connection. Only meaningful on transports
    /// with a writable channel (WebSocket); the HTTP stream is read-only
    /// and control requests travel on separate exchanges.
    async fn send(&mut self, request: &Request) -> Result<(), TransportError>;

    /// The next inbound line, or `None` once the peer has closed.
    /// Cancel safe: dropping the future loses no line.
    async fn next_line(&mut self) -> Option<Result<String, TransportError>>;

    /// Orderly close. Subsequent `next_line` calls drain and end.
    async fn close(&mut self);
}

/// Establishes connections of one flavor.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection against `address` and send `request` on it, if
    /// any. `request: None` performs the handshake only (early WS open).
    async fn open(
        &self,
        address: &str,
        request: Option<&Request>,
        abort: &CancellationToken,
    ) -> Result<Box<dyn StreamConnection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_fallbacks() {
        assert_eq!(
            TransportKind::WsStreaming.polling_variant(),
            TransportKind::WsPolling
        );
        assert_eq!(
            TransportKind::WsPolling.alternate_protocol(),
            TransportKind::HttpStreaming
        );
        assert_eq!(
            TransportKind::HttpStreaming.polling_variant(),
            TransportKind::HttpPolling
        );
        assert!(TransportKind::HttpPolling.is_polling());
        assert!(!TransportKind::WsStreaming.is_polling());
    }
}
