//! Integration tests for broadcasts fanned out by the router

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use switchboard_messenger::{BroadcastFilter, Connection, MethodRegistry, Router, RouterOptions};
use switchboard_transport_memory::MemoryTransport;
use tokio::time::{sleep, timeout};

fn start_router(transport: &MemoryTransport) -> Router {
    let router = Router::new(
        transport.listen().expect("Failed to listen"),
        MethodRegistry::new(),
        RouterOptions::default(),
    );
    router.start().expect("Failed to start router");
    router
}

async fn connect_all(router: &Router, connections: &[&Connection]) {
    for connection in connections {
        connection.connect().await.expect("Failed to connect");
    }

    timeout(Duration::from_secs(2), async {
        while router.clients().len() < connections.len() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("clients never registered");
}

async fn next_broadcast(broadcasts: &mut BoxStream<'static, Value>) -> Option<Value> {
    timeout(Duration::from_millis(200), broadcasts.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_content_broadcast_skips_sender() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let router = start_router(&transport);

    let content_a = Connection::client(transport.clone(), Some("content"));
    let content_b = Connection::client(transport.clone(), Some("content"));
    let action = Connection::client(transport.clone(), Some("action"));
    connect_all(&router, &[&content_a, &content_b, &action]).await;

    let mut to_a = content_a.broadcasts().unwrap();
    let mut to_b = content_b.broadcasts().unwrap();
    let mut to_action = action.broadcasts().unwrap();

    content_a
        .broadcast(json!({"greeting": "hello"}), BroadcastFilter::new("^content"))
        .unwrap();

    assert_eq!(
        next_broadcast(&mut to_b).await,
        Some(json!({"greeting": "hello"}))
    );
    assert_eq!(next_broadcast(&mut to_a).await, None);
    assert_eq!(next_broadcast(&mut to_action).await, None);

    router.shutdown().await;
}

#[tokio::test]
async fn test_router_broadcast_reaches_matching_peers() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let router = start_router(&transport);

    let content_a = Connection::client(transport.clone(), Some("content"));
    let content_b = Connection::client(transport.clone(), Some("content"));
    let action = Connection::client(transport.clone(), Some("action"));
    connect_all(&router, &[&content_a, &content_b, &action]).await;

    let mut to_a = content_a.broadcasts().unwrap();
    let mut to_b = content_b.broadcasts().unwrap();
    let mut to_action = action.broadcasts().unwrap();

    let reached = router
        .send_broadcast("refresh", BroadcastFilter::new("^CONTENT").with_flags("i"))
        .unwrap();
    assert_eq!(reached, 2);

    assert_eq!(next_broadcast(&mut to_a).await, Some(json!("refresh")));
    assert_eq!(next_broadcast(&mut to_b).await, Some(json!("refresh")));
    assert_eq!(next_broadcast(&mut to_action).await, None);

    // The default filter addresses everyone
    assert_eq!(router.send_broadcast(7, BroadcastFilter::default()).unwrap(), 3);
    assert_eq!(next_broadcast(&mut to_action).await, Some(json!(7)));

    router.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_with_invalid_filter_is_dropped() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::new();
    let router = start_router(&transport);

    let sender = Connection::client(transport.clone(), Some("content"));
    let receiver = Connection::client(transport.clone(), Some("content"));
    connect_all(&router, &[&sender, &receiver]).await;

    let mut incoming = receiver.broadcasts().unwrap();

    sender
        .broadcast("lost", BroadcastFilter::new(".*").with_flags("x"))
        .unwrap();
    sender.broadcast("kept", BroadcastFilter::all()).unwrap();

    // The router logs the bad filter and keeps relaying
    assert_eq!(next_broadcast(&mut incoming).await, Some(json!("kept")));

    router.shutdown().await;
}
