//! A browser-extension style setup over the in-memory transport.
//!
//! A background router owns `time` and `ticker`, a popup calls them, and two
//! content scripts exchange broadcasts.
//!
//! Run with `RUST_LOG=debug` to watch the messages flow.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use switchboard_messenger::{
    BroadcastFilter, Connection, MethodCaller, MethodRegistry, Router, RouterOptions,
};
use switchboard_transport_memory::MemoryTransport;
use tokio::time::sleep;
use tokio_stream::wrappers::IntervalStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn background_methods() -> MethodRegistry {
    MethodRegistry::new()
        .value("time", |_args| {
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
            Ok::<_, anyhow::Error>(now.as_secs())
        })
        .stream("ticker", |_args| {
            IntervalStream::new(tokio::time::interval(Duration::from_millis(250)))
                .enumerate()
                .map(|(tick, _)| Ok::<_, anyhow::Error>(tick + 1))
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let transport = MemoryTransport::new();

    let router = Router::new(
        transport.listen()?,
        background_methods(),
        RouterOptions::default(),
    );
    router.start()?;

    let popup = Connection::client(transport.clone(), Some("action"));
    popup.connect().await?;

    let time: u64 = popup.call_method("time", vec![]).value().await?;
    info!("popup: background time is {}", time);

    // Dropping the stream after three ticks unsubscribes from the ticker
    let mut ticker = popup.call_method("ticker", vec![]).take(3);
    while let Some(tick) = ticker.next().await {
        let tick: u64 = serde_json::from_value(tick?)?;
        info!("popup: tick {}", tick);
    }
    drop(ticker);

    let first_tab = Connection::client(transport.clone(), Some("content"));
    let second_tab = Connection::client(transport.clone(), Some("content"));
    first_tab.connect().await?;
    second_tab.connect().await?;

    // Give the router a moment to finish both handshakes
    while router.clients().len() < 3 {
        sleep(Duration::from_millis(10)).await;
    }

    let mut inbox = second_tab.broadcasts()?;
    first_tab.broadcast(
        json!({"from": first_tab.name(), "text": "hello, tabs"}),
        BroadcastFilter::new("^content"),
    )?;

    if let Some(message) = inbox.next().await {
        info!("{} received {}", second_tab.name(), message);
    }

    router.shutdown().await;

    Ok(())
}
