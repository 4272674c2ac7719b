//! Endpoint connecting one context to the router.
//!
//! A [`Connection`] opens a named channel, advertises its local methods,
//! answers calls for them and can call any method known to the router.
//! A connection with no local methods is a plain client.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use switchboard_transport::Transport;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallStream, MethodCaller};
use crate::channel::{Channel, ChannelOptions};
use crate::dispatcher::{Args, MethodRegistry};
use crate::error::{Error, Result};
use crate::protocol::{Broadcast, BroadcastFilter, MethodAdvertisement, MethodCall};
use crate::responder;

/// Lifecycle of a [`Connection`].
///
/// `Connecting` moves to `Connected` or `Failed`; `Connected` moves to
/// `Closed`. `Closed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Not connected yet.
    Connecting,
    /// Channel open and methods advertised.
    Connected,
    /// Channel disconnected.
    Closed,
    /// The channel could not be opened.
    Failed,
}

impl ConnectionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Name prefix, so broadcast filters can address a class of endpoints.
    pub prefix: Option<String>,
    /// Methods this endpoint answers.
    pub methods: MethodRegistry,
    /// Channel configuration.
    pub channel: ChannelOptions,
}

/// An endpoint of the messaging layer.
pub struct Connection {
    name: String,
    transport: Arc<dyn Transport>,
    methods: Arc<MethodRegistry>,
    channel_options: ChannelOptions,
    channel: Arc<RwLock<Option<Channel>>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    connect_lock: Mutex<()>,
}

impl Connection {
    /// Create an endpoint. Nothing happens until [`Connection::connect`].
    pub fn new<T: Transport>(transport: T, options: ConnectionOptions) -> Self {
        let name = match &options.prefix {
            Some(prefix) => format!("{prefix}:{}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        let (status, _) = watch::channel(ConnectionStatus::Connecting);

        Self {
            name,
            transport: Arc::new(transport),
            methods: Arc::new(options.methods),
            channel_options: options.channel,
            channel: Arc::new(RwLock::new(None)),
            status: Arc::new(status),
            connect_lock: Mutex::new(()),
        }
    }

    /// Create a call-only endpoint.
    pub fn client<T: Transport>(transport: T, prefix: Option<&str>) -> Self {
        Self::new(
            transport,
            ConnectionOptions {
                prefix: prefix.map(str::to_string),
                ..ConnectionOptions::default()
            },
        )
    }

    /// Channel name of this endpoint.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Open the channel and advertise local methods.
    ///
    /// Failing to open the channel is not an error: the status becomes
    /// `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` while a channel is active and `Terminated`
    /// once the endpoint is closed or failed.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.channel.read().is_some() {
            return Err(Error::AlreadyConnected);
        }

        let status = self.status();
        if status.is_terminal() {
            return Err(Error::Terminated(status));
        }

        let port = match self.transport.connect(&self.name).await {
            Ok(port) => port,
            Err(e) => {
                warn!("Failed to open channel '{}': {}", self.name, e);
                self.status.send_replace(ConnectionStatus::Failed);
                return Ok(());
            }
        };

        let channel = Channel::new(port, self.channel_options.clone());
        let calls = channel.method_calls();
        channel.start()?;

        channel.send(MethodAdvertisement::new(self.methods.names()));

        *self.channel.write() = Some(channel.clone());
        self.status.send_replace(ConnectionStatus::Connected);

        tokio::spawn(Self::serve_calls(
            channel.clone(),
            Arc::clone(&self.methods),
            calls,
        ));

        let slot = Arc::clone(&self.channel);
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            channel.closed().await;
            slot.write().take();
            status.send_replace(ConnectionStatus::Closed);
            info!("Connection '{}' closed", channel.name());
        });

        info!(
            "Connection '{}' established, advertising {} methods",
            self.name,
            self.methods.len()
        );

        Ok(())
    }

    async fn serve_calls(
        channel: Channel,
        methods: Arc<MethodRegistry>,
        mut calls: BoxStream<'static, MethodCall>,
    ) {
        while let Some(call) = calls.next().await {
            debug!("Handling call '{}' ({})", call.method, call.id);

            let results = methods.invoke(&call.method, Args::from(call.args));
            tokio::spawn(responder::answer(
                channel.clone(),
                call.id,
                call.method,
                results,
            ));
        }
    }

    fn active_channel(&self) -> Option<Channel> {
        self.channel.read().clone()
    }

    /// Send a broadcast to every peer whose name matches `filter`.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` unless connected, or a codec error if `data` is
    /// not representable as JSON.
    pub fn broadcast<D: Serialize>(&self, data: D, filter: BroadcastFilter) -> Result<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(Error::NotReady);
        }
        let channel = self.active_channel().ok_or(Error::NotReady)?;

        debug!("Broadcasting from '{}' to /{}/", self.name, filter.source);
        channel.send(Broadcast::new(serde_json::to_value(data)?, filter));

        Ok(())
    }

    /// Payloads of broadcasts received from now on.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` when no channel is active.
    pub fn broadcasts(&self) -> Result<BoxStream<'static, Value>> {
        let channel = self.active_channel().ok_or(Error::NotReady)?;

        Ok(channel
            .broadcasts()
            .map(|broadcast| broadcast.data)
            .boxed())
    }

    /// Disconnect the channel. The status becomes `Closed`.
    pub fn disconnect(&self) {
        if let Some(channel) = self.active_channel() {
            debug!("Disconnecting '{}'", self.name);
            channel.disconnect();
        }
    }
}

impl MethodCaller for Connection {
    /// Local methods are answered in place; anything else goes through the
    /// router.
    fn call_method(&self, method: &str, args: Vec<Value>) -> CallStream {
        if self.methods.contains(method) {
            debug!("Calling local method '{}'", method);
            return self.methods.invoke(method, Args::from(args));
        }

        match self.active_channel() {
            Some(channel) => channel.call_method(method, args),
            None => CallStream::failed(Error::NotReady),
        }
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}
