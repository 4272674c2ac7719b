//! Hub relaying calls and broadcasts between connected peers.
//!
//! Each accepted channel goes through an advertisement handshake: the peer
//! must announce its methods within [`RouterOptions::advertisement_timeout`].
//! The router then records which peer owns which method, forwards calls to
//! owners, answers its own methods locally and fans broadcasts out by name
//! pattern.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use switchboard_transport::{Listener, Port};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::call::{CallStream, MethodCaller};
use crate::channel::{Channel, ChannelOptions};
use crate::dispatcher::{Args, MethodRegistry};
use crate::error::{Error, Result};
use crate::protocol::{Broadcast, BroadcastFilter, MethodAdvertisement, MethodCall};
use crate::responder;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// How long a new peer may take to advertise its methods.
    pub advertisement_timeout: Duration,
    /// Configuration of every peer channel.
    pub channel: ChannelOptions,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            advertisement_timeout: Duration::from_secs(5),
            channel: ChannelOptions::default(),
        }
    }
}

#[derive(Default)]
struct RouterState {
    /// Peers past the handshake.
    clients: HashMap<String, Channel>,
    /// Names in use, from acceptance until the peer leaves.
    reserved: HashSet<String>,
    /// Method name to owning peer name.
    owners: HashMap<String, String>,
}

struct RouterInner {
    listener: Box<dyn Listener>,
    methods: MethodRegistry,
    options: RouterOptions,
    state: Mutex<RouterState>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// The messaging hub.
///
/// Cheap to clone; every clone drives the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router accepting peers from `listener` and answering
    /// `methods` itself.
    pub fn new<L: Listener>(listener: L, methods: MethodRegistry, options: RouterOptions) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                listener: Box::new(listener),
                methods,
                options,
                state: Mutex::new(RouterState::default()),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start accepting peers.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the router was started (or shut down)
    /// before.
    pub fn start(&self) -> Result<()> {
        if self.inner.task_tracker.is_closed() {
            return Err(Error::AlreadyRunning);
        }

        self.inner.task_tracker.spawn(self.clone().accept_loop());
        self.inner.task_tracker.close();

        info!(
            "Router started with {} local methods",
            self.inner.methods.len()
        );

        Ok(())
    }

    /// Stop accepting peers, disconnect every peer and wait for all tasks.
    pub async fn shutdown(&self) {
        debug!("shutting down router");

        self.inner.shutdown_token.cancel();
        self.inner.listener.close().await;

        let clients: Vec<Channel> = self.inner.state.lock().clients.values().cloned().collect();
        for channel in clients {
            channel.disconnect();
        }

        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
    }

    /// Wait until the router has shut down.
    pub async fn wait(&self) {
        self.inner.task_tracker.wait().await;
    }

    /// Names of connected peers, sorted.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Peer owning `method`, if any.
    #[must_use]
    pub fn method_owner(&self, method: &str) -> Option<String> {
        self.inner.state.lock().owners.get(method).cloned()
    }

    /// Broadcast `data` to every peer whose name matches `filter`.
    ///
    /// Returns the number of peers the broadcast was sent to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilter` if the filter does not compile, or a codec
    /// error if `data` is not representable as JSON.
    pub fn send_broadcast<D: Serialize>(&self, data: D, filter: BroadcastFilter) -> Result<usize> {
        let broadcast = Broadcast::new(serde_json::to_value(data)?, filter);

        self.fan_out(None, &broadcast)
    }

    async fn accept_loop(self) {
        loop {
            tokio::select! {
                biased;
                () = self.inner.shutdown_token.cancelled() => break,
                accepted = self.inner.listener.accept() => match accepted {
                    Ok(port) => {
                        let router = self.clone();
                        self.inner.task_tracker.spawn(router.handle_connection(port));
                    }
                    Err(e) => {
                        debug!("Listener closed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(self, port: Box<dyn Port>) {
        let name = port.name().to_string();

        if name.is_empty() {
            warn!("Connection ignored as it has no name");
            port.disconnect();
            return;
        }

        if !self.reserve(&name) {
            warn!("Connection from client with duplicate name '{}' rejected", name);
            port.disconnect();
            return;
        }

        debug!("Client '{}' connecting", name);

        let channel = Channel::new(port, self.inner.options.channel.clone());
        let advertisements = channel.method_advertisements();
        let calls = channel.method_calls();
        let broadcasts = channel.broadcasts();

        if let Err(e) = channel.start() {
            error!("Failed to start channel '{}': {}", name, e);
            self.release(&name);
            return;
        }

        match self.handshake(advertisements).await {
            Ok(advertisement) => self.register(&name, &channel, advertisement),
            Err(e) => {
                warn!("Client '{}' disconnected during handshake: {}", name, e);
                self.release(&name);
                channel.disconnect();
                return;
            }
        }

        self.relay(&name, &channel, calls, broadcasts).await;

        self.purge(&name);
        channel.disconnect();
    }

    async fn handshake(
        &self,
        mut advertisements: BoxStream<'static, MethodAdvertisement>,
    ) -> Result<MethodAdvertisement> {
        let timeout = self.inner.options.advertisement_timeout;

        tokio::select! {
            biased;
            () = self.inner.shutdown_token.cancelled() => Err(Error::ChannelClosed),
            advertised = tokio::time::timeout(timeout, advertisements.next()) => match advertised {
                Ok(Some(advertisement)) => Ok(advertisement),
                Ok(None) => Err(Error::ChannelClosed),
                Err(_) => Err(Error::AdvertisementTimeout(timeout)),
            }
        }
    }

    async fn relay(
        &self,
        name: &str,
        channel: &Channel,
        mut calls: BoxStream<'static, MethodCall>,
        mut broadcasts: BoxStream<'static, Broadcast>,
    ) {
        let closed = channel.closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                biased;
                () = self.inner.shutdown_token.cancelled() => break,
                Some(call) = calls.next() => self.handle_method_call(name, channel, call),
                Some(broadcast) = broadcasts.next() => {
                    if let Err(e) = self.fan_out(Some(name), &broadcast) {
                        error!("Failed to emit broadcast from '{}': {}", name, e);
                    }
                }
                () = &mut closed => break,
            }
        }
    }

    fn handle_method_call(&self, from: &str, channel: &Channel, call: MethodCall) {
        debug!(
            "Handling call '{}' from client '{}' ({})",
            call.method, from, call.id
        );

        let id = call.id.clone();
        let method = call.method.clone();
        let results = self.route(call);

        self.inner.task_tracker.spawn(responder::answer(
            channel.clone(),
            id,
            method,
            results,
        ));
    }

    /// Local methods win; otherwise the call goes to the owning peer.
    fn route(&self, call: MethodCall) -> CallStream {
        if self.inner.methods.contains(&call.method) {
            debug!("Calling router method '{}'", call.method);
            return self.inner.methods.invoke(&call.method, Args::from(call.args));
        }

        let owner = {
            let state = self.inner.state.lock();
            state.owners.get(&call.method).and_then(|owner| {
                state
                    .clients
                    .get(owner)
                    .map(|channel| (owner.clone(), channel.clone()))
            })
        };

        match owner {
            Some((owner, channel)) => {
                debug!("Forwarding '{}' to client '{}'", call.method, owner);
                channel.send_prepared_method_call(call)
            }
            None => {
                warn!("No client provides method '{}'", call.method);
                CallStream::failed(Error::MethodNotFound(call.method))
            }
        }
    }

    fn fan_out(&self, from: Option<&str>, broadcast: &Broadcast) -> Result<usize> {
        let pattern = broadcast.filter.compile()?;

        let recipients: Vec<(String, Channel)> = self
            .inner
            .state
            .lock()
            .clients
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != from && pattern.is_match(name))
            .map(|(name, channel)| (name.clone(), channel.clone()))
            .collect();

        for (name, channel) in &recipients {
            debug!("Emitting broadcast to client '{}'", name);
            channel.send(broadcast.clone());
        }

        Ok(recipients.len())
    }

    fn reserve(&self, name: &str) -> bool {
        self.inner.state.lock().reserved.insert(name.to_string())
    }

    fn release(&self, name: &str) {
        self.inner.state.lock().reserved.remove(name);
    }

    fn register(&self, name: &str, channel: &Channel, advertisement: MethodAdvertisement) {
        let mut state = self.inner.state.lock();
        state.clients.insert(name.to_string(), channel.clone());

        let mut registered = Vec::new();
        for method in advertisement.methods {
            match state.owners.entry(method) {
                Entry::Occupied(entry) => {
                    if entry.get() != name {
                        warn!(
                            "Client '{}' tried to re-register method '{}' already provided by '{}'",
                            name,
                            entry.key(),
                            entry.get()
                        );
                    }
                }
                Entry::Vacant(entry) => {
                    registered.push(entry.key().clone());
                    entry.insert(name.to_string());
                }
            }
        }
        drop(state);

        info!("Client '{}' connected with methods {:?}", name, registered);
    }

    fn purge(&self, name: &str) {
        let mut state = self.inner.state.lock();
        state.clients.remove(name);
        state.reserved.remove(name);
        state.owners.retain(|_, owner| owner != name);
        drop(state);

        info!("Client '{}' disconnected", name);
    }
}

impl MethodCaller for Router {
    fn call_method(&self, method: &str, args: Vec<Value>) -> CallStream {
        self.route(MethodCall::new(method, args))
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("listener", &self.inner.listener)
            .field("methods", &self.inner.methods)
            .field("clients", &self.clients())
            .finish_non_exhaustive()
    }
}
