use std::time::Duration;
use thiserror::Error;

/// Errors raised by a chat transport.
///
/// `Fault` and `Fatal` are raised by the transport itself when its underlying
/// protocol stack misbehaves: a fault is recoverable by reconnecting that one
/// transport, a fatal error takes the whole process down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("request evicted from the pending table")]
    Evicted,

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport fault: {0}")]
    Fault(String),

    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Fault(e.to_string())
    }
}
