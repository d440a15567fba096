//! Configuration for the SignalR client

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_tungstenite::Connector;

use crate::error::Result;
use crate::protocol::HubProtocol;
use crate::retry::{IntervalRetryPolicy, RetryPolicy};

/// Default interval between keep-alive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Default idle timeout before the connection is considered dead.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default inbound frame size limit (1 MiB).
pub const DEFAULT_MAX_SIZE: usize = 1 << 20;

/// Callback producing a fresh bearer token before every connection attempt.
pub type AccessTokenFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Configuration for connecting to a SignalR hub
#[derive(Clone)]
pub struct SignalRConfig {
    /// Hub endpoint; http(s) URLs go through negotiation, ws(s) connect directly
    pub url: String,

    /// Additional headers for negotiation and the WebSocket upgrade
    pub headers: HashMap<String, String>,

    /// Interval between keep-alive pings when the connection is otherwise idle
    pub ping_interval: Duration,

    /// Maximum silence on the inbound side before the connection is dropped
    pub connection_timeout: Duration,

    /// Inbound frame size limit; `None` disables the limit
    pub max_size: Option<usize>,

    pub(crate) access_token_factory: Option<AccessTokenFactory>,
    pub(crate) protocol: Option<Arc<dyn HubProtocol>>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) tls: Option<Connector>,
}

impl SignalRConfig {
    /// Create a configuration with the given hub URL and defaults:
    /// 10 s ping interval, 30 s connection timeout, 1 MiB frame limit and
    /// the `[1, 2, 4, 8, 16]` second reconnect sequence.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_size: Some(DEFAULT_MAX_SIZE),
            access_token_factory: None,
            protocol: None,
            retry: Arc::new(IntervalRetryPolicy::default()),
            tls: None,
        }
    }

    /// Add a single handshake header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Merge a map of handshake headers.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Install a token factory, invoked once per connection attempt; the
    /// token is attached as `Authorization: Bearer <token>`.
    pub fn access_token_factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.access_token_factory = Some(Arc::new(move || Box::pin(factory())));
        self
    }

    /// Use a custom protocol codec instead of the JSON hub protocol.
    pub fn protocol(mut self, protocol: Arc<dyn HubProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the keep-alive ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the inbound idle timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set or disable the inbound frame size limit.
    pub fn max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Replace the reconnection policy.
    pub fn retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    /// Supply an external TLS connector for wss endpoints.
    pub fn tls(mut self, connector: Connector) -> Self {
        self.tls = Some(connector);
        self
    }
}
