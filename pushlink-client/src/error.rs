use pushlink_core::ProtocolError;
use thiserror::Error;

use crate::transport::TransportError;

/// Public error type of the client.
///
/// Recoverable conditions (transport breaks, retryable server refusals)
/// never surface here; they are absorbed by the retry and stream-sense
/// machinery. What remains is either a local programmer error, reported
/// synchronously, or a fatal server verdict, reported through the client
/// listener.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A CONERR/END/ERROR code the client must not retry.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("client is disconnected")]
    Disconnected,
}
