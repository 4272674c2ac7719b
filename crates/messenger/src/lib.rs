//! Message-passing RPC and broadcast between isolated contexts.
//!
//! Peers talk to one central [`Router`] over named duplex channels. Every
//! peer advertises the methods it offers; any peer can call any advertised
//! method by name and receives a stream of values back, or send a broadcast
//! addressed by a pattern over peer names.
//!
//! # Features
//!
//! - **Streaming calls**: One call yields any number of values, then
//!   completes or fails
//! - **Cancellation**: Dropping a result stream unsubscribes from the call
//! - **Method ownership**: The router forwards each method to the single
//!   peer that advertised it first
//! - **Broadcasts**: Fire-and-forget notifications filtered by peer name
//! - **Pluggable transport**: Anything implementing
//!   [`switchboard_transport::Transport`]
//!
//! # Example
//!
//! ```no_run
//! use switchboard_messenger::{
//!     Connection, ConnectionOptions, MethodCaller, MethodRegistry, Router, RouterOptions,
//! };
//! use switchboard_transport_memory::MemoryTransport;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = MemoryTransport::new();
//!
//!     let router = Router::new(
//!         transport.listen()?,
//!         MethodRegistry::new(),
//!         RouterOptions::default(),
//!     );
//!     router.start()?;
//!
//!     let background = Connection::new(
//!         transport.clone(),
//!         ConnectionOptions {
//!             prefix: Some("bg".to_string()),
//!             methods: MethodRegistry::new()
//!                 .value("time", |_args| Ok::<_, anyhow::Error>("12:00")),
//!             ..ConnectionOptions::default()
//!         },
//!     );
//!     background.connect().await?;
//!
//!     let popup = Connection::client(transport, Some("action"));
//!     popup.connect().await?;
//!
//!     let time: String = popup.call_method("time", vec![]).value().await?;
//!     println!("{time}");
//!
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod call;
mod channel;
mod connection;
mod dispatcher;
mod error;
mod responder;
mod router;

pub mod protocol;

pub use call::{CallStream, MethodCaller};
pub use channel::{Channel, ChannelOptions};
pub use connection::{Connection, ConnectionOptions, ConnectionStatus};
pub use dispatcher::{Args, MethodRegistry, Procedure};
pub use error::{Error, Result};
pub use protocol::{BroadcastFilter, CallId, Message};
pub use router::{Router, RouterOptions};
