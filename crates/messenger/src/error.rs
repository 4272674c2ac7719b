//! Error types for the messenger.

use std::time::Duration;

use switchboard_transport::TransportError;
use thiserror::Error;

use crate::connection::ConnectionStatus;
use crate::protocol::CallId;

/// Result type alias for messenger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for messenger operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `connect` was called while a channel is active.
    #[error("Already connected")]
    AlreadyConnected,

    /// A component was started twice.
    #[error("Already running")]
    AlreadyRunning,

    /// The endpoint reached a terminal status and cannot connect again.
    #[error("Connection is {0} and cannot be reopened")]
    Terminated(ConnectionStatus),

    /// The endpoint has no usable channel.
    #[error("Connection not ready")]
    NotReady,

    /// No local procedure and no owning peer for the method.
    #[error("No such method: '{0}'")]
    MethodNotFound(String),

    /// The answering side reported a failure.
    #[error("{message}")]
    Remote {
        /// Message relayed from the answering side.
        message: String,
        /// Diagnostic trace relayed from the answering side, if any.
        stack: Option<String>,
    },

    /// A local procedure failed.
    #[error("{0}")]
    Handler(anyhow::Error),

    /// A local procedure panicked.
    #[error("Method panicked: {0}")]
    Panicked(String),

    /// The channel disconnected while the call was pending.
    #[error("Channel closed")]
    ChannelClosed,

    /// A call with the same id is already in flight on the channel.
    #[error("Call id '{0}' is already in flight")]
    DuplicateCallId(CallId),

    /// A method stream ended without producing a value.
    #[error("Call completed without a value")]
    NoValue,

    /// The peer did not advertise its methods in time.
    #[error("No method advertisement within {0:?}")]
    AdvertisementTimeout(Duration),

    /// A broadcast filter could not be compiled.
    #[error("Invalid broadcast filter: {0}")]
    InvalidFilter(String),

    /// Values could not be converted to or from JSON.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Diagnostic trace to relay alongside the message on the wire.
    ///
    /// Handler failures render their full cause chain; remote failures pass
    /// the trace they arrived with through unchanged.
    #[must_use]
    pub fn stack(&self) -> Option<String> {
        match self {
            Self::Remote { stack, .. } => stack.clone(),
            Self::Handler(error) => Some(format!("{error:?}")),
            _ => None,
        }
    }
}
