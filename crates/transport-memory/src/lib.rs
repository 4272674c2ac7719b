//! In-memory transport implementation for testing
//!
//! This transport routes channels between endpoints within the same process,
//! perfect for testing and development scenarios. Every [`MemoryTransport`]
//! handle cloned from the same original shares one hub; the hub accepts at
//! most one listener at a time.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use switchboard_transport::{Listener, Port, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

type IncomingSender = flume::Sender<Box<dyn Port>>;

#[derive(Default)]
struct Hub {
    listener: Mutex<Option<IncomingSender>>,
}

impl Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("listening", &self.listener.lock().is_some())
            .finish()
    }
}

/// Memory transport implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    /// Create a transport handle with a fresh hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hub's listener.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyListening` if a live listener is already registered.
    pub fn listen(&self) -> Result<MemoryListener, TransportError> {
        let mut slot = self.hub.listener.lock();

        if slot.as_ref().is_some_and(|tx| !tx.is_disconnected()) {
            return Err(TransportError::AlreadyListening);
        }

        let (incoming_tx, incoming_rx) = flume::unbounded();
        *slot = Some(incoming_tx);
        drop(slot);

        info!("Memory listener registered");

        Ok(MemoryListener {
            hub: Arc::clone(&self.hub),
            incoming_rx,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, name: &str) -> Result<Box<dyn Port>, TransportError> {
        debug!("Connecting memory channel '{}'", name);

        let incoming_tx = self
            .hub
            .listener
            .lock()
            .clone()
            .ok_or_else(|| TransportError::ConnectionFailed("No listener registered".to_string()))?;

        // Create a bidirectional channel pair
        let (client_to_hub_tx, client_to_hub_rx) = flume::unbounded();
        let (hub_to_client_tx, hub_to_client_rx) = flume::unbounded();

        let id = Uuid::new_v4();
        let closed = CancellationToken::new();

        let client_port = MemoryPort {
            id,
            name: name.to_string(),
            sender: client_to_hub_tx,
            receiver: hub_to_client_rx,
            closed: closed.clone(),
        };

        let hub_port = MemoryPort {
            id,
            name: name.to_string(),
            sender: hub_to_client_tx,
            receiver: client_to_hub_rx,
            closed,
        };

        // Hand the far end to the listener
        incoming_tx
            .send_async(Box::new(hub_port))
            .await
            .map_err(|_| TransportError::ConnectionFailed("Listener closed".to_string()))?;

        info!("Memory channel '{}' established ({})", name, id);

        Ok(Box::new(client_port))
    }
}

/// One end of an in-memory channel.
///
/// Both ends share a single disconnect token: disconnecting or dropping
/// either end disconnects the pair. Messages already queued are still
/// delivered before the receiving end reports the disconnect.
struct MemoryPort {
    id: Uuid,
    name: String,
    sender: flume::Sender<Value>,
    receiver: flume::Receiver<Value>,
    closed: CancellationToken,
}

impl Debug for MemoryPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPort")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        trace!("Memory port {} sending {}", self.id, message);

        self.sender
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Value, TransportError> {
        if let Ok(message) = self.receiver.try_recv() {
            return Ok(message);
        }

        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            message = self.receiver.recv_async() => {
                message.map_err(|_| TransportError::ConnectionClosed)
            }
            () = self.closed.cancelled() => {
                // Drain anything that raced the disconnect
                self.receiver
                    .try_recv()
                    .map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    fn disconnect(&self) {
        if !self.closed.is_cancelled() {
            debug!("Disconnecting memory port {} ('{}')", self.id, self.name);
            self.closed.cancel();
        }
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Memory listener implementation
pub struct MemoryListener {
    hub: Arc<Hub>,
    incoming_rx: flume::Receiver<Box<dyn Port>>,
    closed: CancellationToken,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("pending", &self.incoming_rx.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Port>, TransportError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            port = self.incoming_rx.recv_async() => {
                let port = port.map_err(|_| TransportError::ConnectionClosed)?;
                debug!("Memory listener accepted channel '{}'", port.name());
                Ok(port)
            }
        }
    }

    async fn close(&self) {
        debug!("Closing memory listener");
        self.closed.cancel();
        self.hub.listener.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let result = transport.connect("lonely").await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();

        let client_port = transport.connect("client").await.unwrap();
        let hub_port = listener.accept().await.unwrap();

        assert_eq!(hub_port.name(), "client");

        // Test bidirectional communication
        client_port.send(json!({"type": "ping"})).unwrap();
        assert_eq!(hub_port.recv().await.unwrap(), json!({"type": "ping"}));

        hub_port.send(json!({"type": "pong"})).unwrap();
        assert_eq!(client_port.recv().await.unwrap(), json!({"type": "pong"}));

        listener.close().await;
    }

    #[tokio::test]
    async fn test_already_listening() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let _listener = transport.listen().unwrap();

        // Second listener on the same hub should fail
        assert_eq!(
            transport.clone().listen().unwrap_err(),
            TransportError::AlreadyListening
        );
    }

    #[tokio::test]
    async fn test_disconnect_reaches_both_ends() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();

        let client_port = transport.connect("client").await.unwrap();
        let hub_port = listener.accept().await.unwrap();

        client_port.send(json!({"type": "last"})).unwrap();
        client_port.disconnect();

        // Queued message still delivered, then the disconnect
        assert_eq!(hub_port.recv().await.unwrap(), json!({"type": "last"}));
        assert_eq!(
            hub_port.recv().await.unwrap_err(),
            TransportError::ConnectionClosed
        );
        assert_eq!(
            hub_port.send(json!({"type": "late"})).unwrap_err(),
            TransportError::ConnectionClosed
        );
        assert_eq!(
            client_port.recv().await.unwrap_err(),
            TransportError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_drop_disconnects_peer() {
        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();

        let client_port = transport.connect("client").await.unwrap();
        let hub_port = listener.accept().await.unwrap();

        drop(client_port);

        assert_eq!(
            hub_port.recv().await.unwrap_err(),
            TransportError::ConnectionClosed
        );
    }
}
