use thiserror::Error;

/// Errors raised by transport implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// A named channel could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The port (or listener) has been disconnected.
    #[error("connection closed")]
    ConnectionClosed,

    /// A listener is already registered on this transport.
    #[error("a listener is already registered")]
    AlreadyListening,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}
