//! Generic transport abstraction for named duplex channels
//!
//! This crate describes the host-provided channel factory the messenger runs
//! on. Concrete transports (in-memory, browser runtime ports, sockets) live
//! in separate crates.
//!
//! A transport provides:
//! - Connect-by-name to the hub
//! - Fire-and-forget sends of structured messages
//! - Ordered delivery of incoming messages
//! - A one-shot disconnect signal, surfaced as a receive error
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;

pub use error::TransportError;

/// Opens named channels to the hub.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel identified by `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened (no hub listening,
    /// hub shut down, ...).
    async fn connect(&self, name: &str) -> Result<Box<dyn Port>, TransportError>;
}

/// Accepts channels opened by peers.
#[async_trait]
pub trait Listener: Debug + Send + Sync + 'static {
    /// Wait for the next inbound channel.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once the listener has been closed.
    async fn accept(&self) -> Result<Box<dyn Port>, TransportError>;

    /// Stop accepting channels.
    async fn close(&self);
}

/// One end of a named duplex channel.
///
/// The transport gives no request/response semantics: messages are opaque
/// structured values that survive the trip unchanged.
#[async_trait]
pub trait Port: Debug + Send + Sync + 'static {
    /// The channel name chosen by the connecting side (may be empty).
    fn name(&self) -> &str;

    /// Queue a message for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the port is already disconnected.
    fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Receive the next message.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` when the channel has been disconnected by
    /// either side. Every later call fails the same way.
    async fn recv(&self) -> Result<Value, TransportError>;

    /// Disconnect the channel. Idempotent.
    fn disconnect(&self);
}
