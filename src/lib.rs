//! SignalR Client for Rust
//!
//! An async client for the SignalR hub protocol (JSON variant) over
//! WebSockets, with automatic negotiation, handshake, keep-alive and
//! reconnection. Register handlers, drive the connection with `run()`, and
//! call hub methods from any task.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use signalr_client::{SignalRClient, SignalRConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SignalRConfig::new("https://example.com/weatherHub")
//!         .access_token_factory(|| async { Ok("token".to_string()) });
//!     let client = SignalRClient::new(config);
//!
//!     // React to server events
//!     client.on("ReceiveMessage", |args| async move {
//!         println!("message: {args:?}");
//!         Ok(None)
//!     });
//!
//!     // Answer server-initiated result requests
//!     client.on("Ping", |_args| async move { Ok(Some(json!("pong"))) });
//!
//!     // Drive the connection in the background
//!     let runner = {
//!         let client = client.clone();
//!         tokio::spawn(async move { client.run().await })
//!     };
//!
//!     // Call hub methods once connected
//!     let sum = client.invoke("Add", vec![json!(1), json!(2)]).await?;
//!     println!("sum: {sum}");
//!
//!     client.close();
//!     runner.await??;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod messages;
mod protocol;
mod retry;
mod transport;
mod utils;

pub use client::{ClientStream, ConnectionState, HandlerResult, InvocationStream, SignalRClient};
pub use config::{
    AccessTokenFactory, SignalRConfig, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_SIZE,
    DEFAULT_PING_INTERVAL,
};
pub use error::{Result, SignalRError};
pub use messages::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HandshakeRequest, HandshakeResponse,
    InvocationMessage, JsonMessage, Message, StreamInvocationMessage, StreamItemMessage,
};
pub use protocol::{
    HubProtocol, JsonHubProtocol, PlainJsonProtocol, TransferFormat, RECORD_SEPARATOR,
};
pub use retry::{IntervalRetryPolicy, RetryPolicy, UnboundedRetryPolicy};

// TLS connector type accepted by `SignalRConfig::tls`
pub use tokio_tungstenite::Connector;
