//! Message channel over one transport port.
//!
//! A single demultiplexing task reads the port, validates every incoming
//! value and routes it:
//! - returns, completions and errors to the pending outbound call they
//!   answer, by id
//! - unsubscribes to the inbound call they cancel, by id
//! - calls and advertisements to lossless per-view queues
//! - broadcasts to a bounded fan-out where a slow view loses the oldest

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use switchboard_transport::Port;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::call::CallStream;
use crate::error::{Error, Result};
use crate::protocol::{
    Broadcast, CallId, Message, MethodAdvertisement, MethodCall, MethodUnsubscribe,
};

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Broadcasts buffered per view before a slow view starts losing them.
    pub fanout_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            fanout_capacity: 1024,
        }
    }
}

/// What the peer said about one of our outbound calls.
#[derive(Debug)]
enum CallEvent {
    Return(Value),
    Error {
        message: String,
        stack: Option<String>,
    },
    Completion,
    Unsubscribe,
}

type CallEventSender = mpsc::UnboundedSender<CallEvent>;

/// Views of one message kind that must see every message.
struct Subscribers<T> {
    // None once the channel has closed
    senders: Mutex<Option<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    fn new() -> Self {
        Self {
            senders: Mutex::new(Some(Vec::new())),
        }
    }

    fn subscribe(&self) -> BoxStream<'static, T> {
        let mut senders = self.senders.lock();
        let Some(senders) = senders.as_mut() else {
            return futures::stream::empty().boxed();
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        senders.push(sender);

        UnboundedReceiverStream::new(receiver).boxed()
    }

    fn publish(&self, item: &T) {
        if let Some(senders) = self.senders.lock().as_mut() {
            senders.retain(|sender| sender.send(item.clone()).is_ok());
        }
    }

    fn close(&self) {
        self.senders.lock().take();
    }
}

struct ChannelInner {
    name: String,
    port: Box<dyn Port>,
    pending_calls: DashMap<CallId, CallEventSender>,
    inbound_calls: DashMap<CallId, CancellationToken>,
    calls: Subscribers<MethodCall>,
    advertisements: Subscribers<MethodAdvertisement>,
    fanout: Mutex<Option<broadcast::Sender<Broadcast>>>,
    closed: CancellationToken,
}

impl ChannelInner {
    fn send(&self, message: Message) {
        if self.closed.is_cancelled() {
            trace!(
                "Skipping {} on closed channel '{}'",
                message.kind(),
                self.name
            );
            return;
        }

        let kind = message.kind();
        match message.into_value() {
            Ok(value) => {
                trace!("Channel '{}' sending {}", self.name, kind);
                if let Err(e) = self.port.send(value) {
                    debug!("Channel '{}' failed to send {}: {}", self.name, kind, e);
                }
            }
            Err(e) => warn!("Failed to encode {} message: {}", kind, e),
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::MethodCall(call) => {
                self.inbound_calls.entry(call.id.clone()).or_default();
                self.calls.publish(&call);
            }
            Message::MethodAdvertisement(advertisement) => {
                self.advertisements.publish(&advertisement);
            }
            Message::Broadcast(broadcast) => {
                if let Some(fanout) = &*self.fanout.lock() {
                    if fanout.receiver_count() > 0 {
                        let _ = fanout.send(broadcast);
                    }
                }
            }
            Message::MethodReturn(r) => self.notify(&r.id, CallEvent::Return(r.value), false),
            Message::MethodCompletion(c) => self.notify(&c.id, CallEvent::Completion, true),
            Message::Error(e) => self.notify(
                &e.id,
                CallEvent::Error {
                    message: e.message,
                    stack: e.stack,
                },
                true,
            ),
            Message::MethodUnsubscribe(u) => {
                if let Some(token) = self.inbound_calls.get(&u.id) {
                    debug!("Peer '{}' unsubscribed from call {}", self.name, u.id);
                    token.cancel();
                }
                self.notify(&u.id, CallEvent::Unsubscribe, true);
            }
        }
    }

    fn notify(&self, id: &CallId, event: CallEvent, terminal: bool) {
        let delivered = if terminal {
            self.pending_calls
                .remove(id)
                .is_some_and(|(_, sender)| sender.send(event).is_ok())
        } else {
            self.pending_calls
                .get(id)
                .is_some_and(|sender| sender.send(event).is_ok())
        };

        if !delivered {
            trace!("Discarding late message for call {} on '{}'", id, self.name);
        }
    }

    fn unsubscribe_token(&self, id: &CallId) -> CancellationToken {
        self.inbound_calls.entry(id.clone()).or_default().clone()
    }

    fn shutdown(&self) {
        self.closed.cancel();
        if self.fanout.lock().take().is_none() {
            return;
        }

        debug!("Channel '{}' closed", self.name);
        self.calls.close();
        self.advertisements.close();
        self.pending_calls.clear();
        self.inbound_calls.clear();
    }
}

/// A named duplex connection speaking the message protocol.
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    task_tracker: TaskTracker,
}

impl Channel {
    /// Wrap `port`. Nothing is read until [`Channel::start`].
    #[must_use]
    pub fn new(port: Box<dyn Port>, options: ChannelOptions) -> Self {
        let (fanout, _) = broadcast::channel(options.fanout_capacity.max(1));

        Self {
            inner: Arc::new(ChannelInner {
                name: port.name().to_string(),
                port,
                pending_calls: DashMap::new(),
                inbound_calls: DashMap::new(),
                calls: Subscribers::new(),
                advertisements: Subscribers::new(),
                fanout: Mutex::new(Some(fanout)),
                closed: CancellationToken::new(),
            }),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Start reading the port.
    ///
    /// Views subscribed before this call observe every message.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the channel was started before.
    pub fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyRunning);
        }

        let inner = Arc::clone(&self.inner);
        self.task_tracker.spawn(async move {
            Self::demultiplex(&inner).await;
            inner.shutdown();
        });

        self.task_tracker.close();

        Ok(())
    }

    async fn demultiplex(inner: &ChannelInner) {
        loop {
            let value = tokio::select! {
                biased;
                () = inner.closed.cancelled() => break,
                received = inner.port.recv() => match received {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Channel '{}' disconnected: {}", inner.name, e);
                        break;
                    }
                }
            };

            match Message::from_value(value) {
                Some(message) => inner.dispatch(message),
                None => trace!("Ignoring malformed message on '{}'", inner.name),
            }
        }
    }

    /// Name the channel was opened with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the channel has disconnected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has disconnected.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.inner.closed.clone().cancelled_owned()
    }

    /// Send a message. Skipped once the channel is closed.
    pub fn send(&self, message: impl Into<Message>) {
        self.inner.send(message.into());
    }

    /// Disconnect the channel.
    pub fn disconnect(&self) {
        self.inner.port.disconnect();
        self.inner.shutdown();
    }

    /// Call `method` on the peer with a fresh id.
    pub fn call_method(&self, method: &str, args: Vec<Value>) -> CallStream {
        self.send_prepared_method_call(MethodCall::new(method, args))
    }

    /// Call the peer with an already built call, keeping its id.
    pub fn send_prepared_method_call(&self, call: MethodCall) -> CallStream {
        if self.is_closed() {
            return CallStream::failed(Error::ChannelClosed);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.inner.pending_calls.entry(call.id.clone()) {
            Entry::Occupied(_) => return CallStream::failed(Error::DuplicateCallId(call.id)),
            Entry::Vacant(entry) => {
                entry.insert(events_tx);
            }
        }

        // Shutdown may have cleared the table before our insert landed
        if self.is_closed() {
            self.inner.pending_calls.remove(&call.id);
            return CallStream::failed(Error::ChannelClosed);
        }

        debug!(
            "Calling '{}' on '{}' ({})",
            call.method, self.inner.name, call.id
        );

        let pending = PendingCall {
            id: call.id.clone(),
            channel: Arc::clone(&self.inner),
            events: events_rx,
            completed: false,
            finished: false,
        };

        self.inner.send(Message::MethodCall(call));

        CallStream::new(pending)
    }

    /// Resolves when the peer unsubscribes from inbound call `id`.
    pub fn on_method_unsubscribe(&self, id: &CallId) -> WaitForCancellationFutureOwned {
        self.inner.unsubscribe_token(id).cancelled_owned()
    }

    /// Forget the unsubscribe signal of a settled inbound call.
    pub fn release_method_unsubscribe(&self, id: &CallId) {
        self.inner.inbound_calls.remove(id);
    }

    /// Incoming method calls. Never loses a call, however slowly read.
    #[must_use]
    pub fn method_calls(&self) -> BoxStream<'static, MethodCall> {
        self.inner.calls.subscribe()
    }

    /// Incoming method advertisements.
    #[must_use]
    pub fn method_advertisements(&self) -> BoxStream<'static, MethodAdvertisement> {
        self.inner.advertisements.subscribe()
    }

    /// Incoming broadcasts.
    ///
    /// A view more than `fanout_capacity` broadcasts behind skips the oldest.
    #[must_use]
    pub fn broadcasts(&self) -> BoxStream<'static, Broadcast> {
        let Some(receiver) = self.inner.fanout.lock().as_ref().map(broadcast::Sender::subscribe)
        else {
            return futures::stream::empty().boxed();
        };

        let name = self.inner.name.clone();
        BroadcastStream::new(receiver)
            .filter_map(move |received| {
                let broadcast = match received {
                    Ok(broadcast) => Some(broadcast),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("Broadcast view on '{}' lagged, {} lost", name, skipped);
                        None
                    }
                };
                futures::future::ready(broadcast)
            })
            .boxed()
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.inner.pending_calls.len())
            .finish_non_exhaustive()
    }
}

/// Result stream of one outbound call.
struct PendingCall {
    id: CallId,
    channel: Arc<ChannelInner>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    completed: bool,
    finished: bool,
}

impl PendingCall {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.channel.pending_calls.remove(&self.id);

        if !self.completed && !self.channel.closed.is_cancelled() {
            debug!("Unsubscribing from call {}", self.id);
            self.channel
                .send(Message::MethodUnsubscribe(MethodUnsubscribe::new(
                    self.id.clone(),
                )));
        }
    }
}

impl Stream for PendingCall {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let item = match ready!(self.events.poll_recv(cx)) {
            Some(CallEvent::Return(value)) => return Poll::Ready(Some(Ok(value))),
            Some(CallEvent::Completion) => {
                self.completed = true;
                None
            }
            Some(CallEvent::Unsubscribe) => None,
            Some(CallEvent::Error { message, stack }) => Some(Err(Error::Remote { message, stack })),
            None => Some(Err(Error::ChannelClosed)),
        };

        self.finish();
        Poll::Ready(item)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use switchboard_transport::{Listener, Transport};
    use switchboard_transport_memory::MemoryTransport;
    use tokio::time::timeout;

    use crate::protocol::{ErrorMessage, MethodCompletion, MethodReturn};

    /// A started channel and the raw port of its peer.
    async fn channel_pair() -> (Channel, Box<dyn Port>) {
        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();

        let port = transport.connect("content:test").await.unwrap();
        let peer = listener.accept().await.unwrap();

        let channel = Channel::new(port, ChannelOptions::default());
        channel.start().unwrap();

        (channel, peer)
    }

    async fn recv_message(peer: &dyn Port) -> Message {
        let value = timeout(Duration::from_secs(1), peer.recv())
            .await
            .expect("timed out")
            .unwrap();
        Message::from_value(value).unwrap()
    }

    fn send_message(peer: &dyn Port, message: impl Into<Message>) {
        let message: Message = message.into();
        peer.send(message.into_value().unwrap()).unwrap();
    }

    async fn recv_call(peer: &dyn Port) -> MethodCall {
        match recv_message(peer).await {
            Message::MethodCall(call) => call,
            other => panic!("expected a call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_returns_then_completion() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let results = channel.call_method("count", vec![json!(3)]);

        let call = recv_call(&*peer).await;
        assert_eq!(call.method, "count");
        assert_eq!(call.args, vec![json!(3)]);

        for i in 1..=3 {
            send_message(&*peer, MethodReturn::new(call.id.clone(), json!(i)));
        }
        send_message(&*peer, MethodCompletion::new(call.id.clone()));

        let values: Vec<u64> = timeout(Duration::from_secs(1), results.values())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        // Completed calls are never unsubscribed
        channel.disconnect();
        assert!(peer.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_remote_error_ends_stream() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let mut results = channel.call_method("time", vec![]);

        let call = recv_call(&*peer).await;
        send_message(
            &*peer,
            ErrorMessage::new(call.id.clone(), "clock broken", Some("at tick".into())),
        );

        match results.next().await {
            Some(Err(Error::Remote { message, stack })) => {
                assert_eq!(message, "clock broken");
                assert_eq!(stack.as_deref(), Some("at tick"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(results.next().await.is_none());

        // An errored call still tells the peer to stop
        match recv_message(&*peer).await {
            Message::MethodUnsubscribe(u) => assert_eq!(u.id, call.id),
            other => panic!("expected unsubscribe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_once() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let results = channel.call_method("ticker", vec![]);

        let call = recv_call(&*peer).await;
        for i in 1..=5 {
            send_message(&*peer, MethodReturn::new(call.id.clone(), json!(i)));
        }

        let taken: Vec<_> = results.take(3).collect().await;
        assert_eq!(taken.len(), 3);

        match recv_message(&*peer).await {
            Message::MethodUnsubscribe(u) => assert_eq!(u.id, call.id),
            other => panic!("expected unsubscribe, got {other:?}"),
        }

        // Late messages for the abandoned id are ignored
        send_message(&*peer, MethodReturn::new(call.id.clone(), json!(6)));
        send_message(&*peer, MethodCompletion::new(call.id.clone()));

        assert!(
            timeout(Duration::from_millis(50), peer.recv()).await.is_err(),
            "nothing more should be sent"
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_call() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let mut results = channel.call_method("time", vec![]);
        let _call = recv_call(&*peer).await;

        peer.disconnect();

        let item = timeout(Duration::from_secs(1), results.next()).await.unwrap();
        assert!(matches!(item, Some(Err(Error::ChannelClosed))));
        assert!(results.next().await.is_none());

        timeout(Duration::from_secs(1), channel.closed()).await.unwrap();
        assert!(channel.is_closed());

        // Calls on a closed channel fail immediately
        let late = channel.call_method("time", vec![]).value::<Value>().await;
        assert!(matches!(late, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let (channel, peer) = channel_pair().await;

        let id = CallId::from("fixed");
        let _first = channel.send_prepared_method_call(MethodCall::with_id(id.clone(), "a", vec![]));
        let second = channel.send_prepared_method_call(MethodCall::with_id(id.clone(), "b", vec![]));

        let result = second.value::<Value>().await;
        assert!(matches!(result, Err(Error::DuplicateCallId(dup)) if dup == id));

        // Only the first call reached the peer
        assert_eq!(recv_call(&*peer).await.method, "a");
    }

    #[tokio::test]
    async fn test_views_classify_and_skip_malformed() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();
        let port = transport.connect("content:views").await.unwrap();
        let peer = listener.accept().await.unwrap();

        let channel = Channel::new(port, ChannelOptions::default());
        let mut calls = channel.method_calls();
        let mut broadcasts = channel.broadcasts();
        let mut advertisements = channel.method_advertisements();
        channel.start().unwrap();

        peer.send(json!({"type": "method-call", "id": 1})).unwrap();
        peer.send(json!("not a message")).unwrap();
        send_message(&*peer, MethodAdvertisement::new(["time"]));
        send_message(&*peer, MethodCall::with_id("c1".into(), "time", vec![]));
        send_message(&*peer, Broadcast::new(json!("hi"), "^content".into()));

        let advertisement = timeout(Duration::from_secs(1), advertisements.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(advertisement.methods, vec!["time"]);

        let call = timeout(Duration::from_secs(1), calls.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.id.as_str(), "c1");

        let broadcast = timeout(Duration::from_secs(1), broadcasts.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broadcast.data, json!("hi"));

        // Views end once the channel closes
        peer.disconnect();
        assert!(timeout(Duration::from_secs(1), calls.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inbound_unsubscribe_signal() {
        let (channel, peer) = channel_pair().await;
        let mut calls = channel.method_calls();

        send_message(&*peer, MethodCall::with_id("in-1".into(), "ticker", vec![]));
        let call = timeout(Duration::from_secs(1), calls.next())
            .await
            .unwrap()
            .unwrap();

        let unsubscribed = channel.on_method_unsubscribe(&call.id);
        send_message(&*peer, MethodUnsubscribe::new(call.id.clone()));

        timeout(Duration::from_secs(1), unsubscribed).await.unwrap();
        channel.release_method_unsubscribe(&call.id);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (channel, _peer) = channel_pair().await;

        assert!(matches!(channel.start(), Err(Error::AlreadyRunning)));
    }
}
