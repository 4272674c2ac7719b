//! Answers inbound calls.

use futures::StreamExt;
use tracing::{debug, trace};

use crate::call::CallStream;
use crate::channel::Channel;
use crate::protocol::{CallId, ErrorMessage, MethodCompletion, MethodReturn};

enum Settled {
    Completed,
    Unsubscribed,
    Failed(crate::Error),
    Disconnected,
}

/// Relay `results` to the peer as the answer to inbound call `id`.
///
/// Every value becomes a `MethodReturn`. The call then settles with exactly
/// one terminal message: an `Error` if the results failed, otherwise a
/// `MethodCompletion`, also when the peer unsubscribed first. Nothing is
/// sent once the channel is closed.
pub(crate) async fn answer(channel: Channel, id: CallId, method: String, mut results: CallStream) {
    let unsubscribed = channel.on_method_unsubscribe(&id);
    let closed = channel.closed();
    tokio::pin!(unsubscribed, closed);

    let settled = loop {
        tokio::select! {
            biased;
            () = &mut closed => break Settled::Disconnected,
            () = &mut unsubscribed => break Settled::Unsubscribed,
            item = results.next() => match item {
                Some(Ok(value)) => {
                    trace!("Returning value for '{}' ({})", method, id);
                    channel.send(MethodReturn::new(id.clone(), value));
                }
                Some(Err(error)) => break Settled::Failed(error),
                None => break Settled::Completed,
            }
        }
    };

    // Stops local producers and unsubscribes forwarded calls upstream
    drop(results);

    match settled {
        Settled::Completed => {
            debug!("Call '{}' ({}) completed", method, id);
            channel.send(MethodCompletion::new(id.clone()));
        }
        Settled::Unsubscribed => {
            debug!("Call '{}' ({}) unsubscribed by '{}'", method, id, channel.name());
            channel.send(MethodCompletion::new(id.clone()));
        }
        Settled::Failed(error) => {
            debug!("Call '{}' ({}) failed: {}", method, id, error);
            channel.send(ErrorMessage::from_error(id.clone(), &error));
        }
        Settled::Disconnected => {
            debug!("Channel '{}' closed while answering '{}' ({})", channel.name(), method, id);
        }
    }

    channel.release_method_unsubscribe(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures::stream;
    use serde_json::{Value, json};
    use switchboard_transport::{Listener, Port, Transport};
    use switchboard_transport_memory::MemoryTransport;
    use tokio::time::timeout;

    use crate::channel::ChannelOptions;
    use crate::protocol::{Message, MethodUnsubscribe};
    use crate::{Error, Result};

    async fn channel_pair() -> (Channel, Box<dyn Port>) {
        let transport = MemoryTransport::new();
        let listener = transport.listen().unwrap();

        let port = transport.connect("bg").await.unwrap();
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

    #[tokio::test]
    async fn test_values_then_single_completion() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let results = CallStream::new(stream::iter([Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]));

        answer(channel, "c1".into(), "count".into(), results).await;

        for expected in 1..=3 {
            match recv_message(&*peer).await {
                Message::MethodReturn(r) => assert_eq!(r.value, json!(expected)),
                other => panic!("expected a return, got {other:?}"),
            }
        }
        assert!(matches!(
            recv_message(&*peer).await,
            Message::MethodCompletion(c) if c.id.as_str() == "c1"
        ));
        assert!(timeout(Duration::from_millis(50), peer.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_sends_error_without_completion() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let results = CallStream::failed(Error::MethodNotFound("time".to_string()));

        answer(channel, "c2".into(), "time".into(), results).await;

        match recv_message(&*peer).await {
            Message::Error(e) => {
                assert_eq!(e.id.as_str(), "c2");
                assert_eq!(e.message, "No such method: 'time'");
            }
            other => panic!("expected an error, got {other:?}"),
        }
        assert!(timeout(Duration::from_millis(50), peer.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_and_completes() {
        let _ = tracing_subscriber::fmt::try_init();

        let (channel, peer) = channel_pair().await;
        let (values_tx, values_rx) = tokio::sync::mpsc::unbounded_channel::<Result<Value>>();
        let results = CallStream::new(tokio_stream::wrappers::UnboundedReceiverStream::new(values_rx));

        let task = tokio::spawn(answer(channel, "c3".into(), "ticker".into(), results));

        values_tx.send(Ok(json!(1))).unwrap();
        assert!(matches!(recv_message(&*peer).await, Message::MethodReturn(_)));

        let unsubscribe = Message::from(MethodUnsubscribe::new("c3".into()));
        peer.send(unsubscribe.into_value().unwrap()).unwrap();

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(recv_message(&*peer).await, Message::MethodCompletion(_)));

        // The producer was dropped
        assert!(values_tx.send(Ok(json!(2))).is_err());
    }
}
