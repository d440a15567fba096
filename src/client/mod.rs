//! SignalR client facade
//!
//! The public surface: handler registration, sends, invocations, streams
//! and the connection lifecycle. The heavy lifting lives in
//! [`connection`]; this module owns the shared per-client state.

mod connection;
mod registry;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::SignalRConfig;
use crate::error::{Result, SignalRError};
use crate::messages::{
    CancelInvocationMessage, CompletionMessage, InvocationMessage, Message, StreamInvocationMessage,
    StreamItemMessage,
};
use crate::protocol::{HubProtocol, JsonHubProtocol};
use crate::transport::websocket::Outbound;

use registry::{InvocationRegistry, StreamEvent};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// Negotiating and opening the WebSocket
    Connecting,
    /// Socket open, hub handshake in flight
    Handshaking,
    /// Handshake accepted; operations are available
    Connected,
    /// Connection lost, retry policy engaged
    Reconnecting,
    /// `close()` was called or the server directed a final close
    Closed,
}

/// What an event handler returns: `Some(value)` supplies a client result,
/// `None` a void result, `Err(text)` an error (encoded into an error
/// completion for client results, reported to `on_error` otherwise).
pub type HandlerResult = std::result::Result<Option<Value>, String>;

pub(crate) type EventHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub(crate) type LifecycleHandler =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;
pub(crate) type ErrorHandler =
    Arc<dyn Fn(CompletionMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared per-client state
pub(crate) struct ClientInner {
    pub(crate) config: SignalRConfig,
    pub(crate) protocol: Arc<dyn HubProtocol>,

    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    pub(crate) handlers: Mutex<HashMap<String, EventHandler>>,
    pub(crate) open_handler: Mutex<Option<LifecycleHandler>>,
    pub(crate) close_handler: Mutex<Option<LifecycleHandler>>,
    pub(crate) error_handler: Mutex<Option<ErrorHandler>>,

    pub(crate) registry: InvocationRegistry,

    // channel into the current epoch's writer task; None while disconnected
    pub(crate) outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    pub(crate) last_send: Arc<Mutex<Instant>>,
    pub(crate) last_recv: Arc<Mutex<Instant>>,
}

impl ClientInner {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = *self.state_rx.borrow();
        if previous == state {
            return;
        }
        info!(from = ?previous, to = ?state, "connection state changed");
        let _ = self.state.send(state);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SignalRError::Closed);
        }
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(SignalRError::NotConnected),
        }
    }

    /// Encode and queue a message; the writer task guarantees one frame is
    /// fully written before the next begins.
    pub(crate) async fn send_message(&self, message: &Message) -> Result<()> {
        let bytes = self.protocol.encode(message)?;
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or(SignalRError::NotConnected)?;
        tx.send(Outbound::Frame(bytes))
            .await
            .map_err(|_| SignalRError::NotConnected)
    }

    pub(crate) async fn fire_open(&self) {
        let handler = self.open_handler.lock().clone();
        if let Some(handler) = handler {
            if let Err(error) = handler().await {
                warn!(error = %error, "open handler failed");
                self.report_error(CompletionMessage::with_error(String::new(), error))
                    .await;
            }
        }
    }

    pub(crate) async fn fire_close(&self) {
        let handler = self.close_handler.lock().clone();
        if let Some(handler) = handler {
            if let Err(error) = handler().await {
                warn!(error = %error, "close handler failed");
                self.report_error(CompletionMessage::with_error(String::new(), error))
                    .await;
            }
        }
    }

    pub(crate) async fn report_error(&self, completion: CompletionMessage) {
        let handler = self.error_handler.lock().clone();
        match handler {
            Some(handler) => handler(completion).await,
            None => warn!(error = ?completion.error, "unhandled error (no on_error handler)"),
        }
    }

    /// Send a `CancelInvocation` for a detached caller. The registry entry
    /// stays until the server's completion retires the id.
    pub(crate) fn spawn_cancel(self: &Arc<Self>, invocation_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.clone();
        handle.spawn(async move {
            let message = Message::CancelInvocation(CancelInvocationMessage {
                invocation_id: invocation_id.clone(),
                headers: None,
            });
            if inner.send_message(&message).await.is_err() {
                debug!(id = %invocation_id, "connection gone before cancellation was sent");
            }
        });
    }
}

/// Async SignalR client
///
/// Cheaply cloneable; clones share the same connection. Register handlers,
/// then drive the connection with [`run`](SignalRClient::run) while other
/// tasks call [`send`](SignalRClient::send), [`invoke`](SignalRClient::invoke)
/// or [`stream`](SignalRClient::stream).
#[derive(Clone)]
pub struct SignalRClient {
    inner: Arc<ClientInner>,
}

impl SignalRClient {
    /// Create a new client; no connection is made until `run()`.
    pub fn new(config: SignalRConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let protocol = config
            .protocol
            .clone()
            .unwrap_or_else(|| Arc::new(JsonHubProtocol::new()));

        let inner = Arc::new(ClientInner {
            config,
            protocol,
            state: state_tx,
            state_rx,
            shutdown: shutdown_tx,
            shutdown_rx,
            handlers: Mutex::new(HashMap::new()),
            open_handler: Mutex::new(None),
            close_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            registry: InvocationRegistry::new(),
            outbound: Mutex::new(None),
            last_send: Arc::new(Mutex::new(Instant::now())),
            last_recv: Arc::new(Mutex::new(Instant::now())),
        });

        Self { inner }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// A receiver notified on every connection state change.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Register the handler for `event`, replacing any previous one.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let event = event.into();
        let handler: EventHandler = Arc::new(move |args| Box::pin(handler(args)));
        if self
            .inner
            .handlers
            .lock()
            .insert(event.clone(), handler)
            .is_some()
        {
            debug!(event = %event, "replaced existing event handler");
        }
    }

    /// Register the handler fired after every successful (re)connect.
    pub fn on_open<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        *self.inner.open_handler.lock() = Some(Arc::new(move || Box::pin(handler())));
    }

    /// Register the handler fired when a connected epoch ends.
    pub fn on_close<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        *self.inner.close_handler.lock() = Some(Arc::new(move || Box::pin(handler())));
    }

    /// Register the handler receiving server-reported and handler errors.
    pub fn on_error<F, Fut>(&self, handler: F)
    where
        F: Fn(CompletionMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.inner.error_handler.lock() = Some(Arc::new(move |c| Box::pin(handler(c))));
    }

    /// Fire-and-forget invocation; no response is expected.
    pub async fn send(&self, target: impl Into<String>, arguments: Vec<Value>) -> Result<()> {
        self.inner.ensure_connected()?;
        let message = Message::Invocation(InvocationMessage {
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: None,
            headers: None,
        });
        self.inner.send_message(&message).await
    }

    /// Invoke a hub method and await its completion.
    ///
    /// Returns the server's result value (`Null` for a void completion), or
    /// `Server` when the completion carries an error. Dropping the returned
    /// future before completion sends a `CancelInvocation`.
    pub async fn invoke(&self, target: impl Into<String>, arguments: Vec<Value>) -> Result<Value> {
        self.inner.ensure_connected()?;

        let id = self.inner.registry.next_invocation_id();
        let rx = self.inner.registry.register_invoke(&id)?;
        let message = Message::Invocation(InvocationMessage {
            invocation_id: Some(id.clone()),
            target: target.into(),
            arguments,
            stream_ids: None,
            headers: None,
        });

        let mut guard = CancelGuard {
            inner: self.inner.clone(),
            invocation_id: id.clone(),
            armed: true,
        };

        if let Err(e) = self.inner.send_message(&message).await {
            guard.armed = false;
            self.inner.registry.discard(&id);
            return Err(e);
        }

        let completion = rx
            .await
            .map_err(|_| SignalRError::Connection("connection closed before completion".into()))?;
        guard.armed = false;

        if let Some(error) = completion.error {
            return Err(SignalRError::Server(error));
        }
        Ok(completion.result.unwrap_or(Value::Null))
    }

    /// Invoke a streaming hub method.
    ///
    /// Items arrive in server order; the stream ends at the completion (an
    /// error completion surfaces as a final `Err` item). Dropping the stream
    /// before it completes sends a `CancelInvocation`.
    pub async fn stream(
        &self,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Result<InvocationStream> {
        self.inner.ensure_connected()?;

        let id = self.inner.registry.next_invocation_id();
        let rx = self.inner.registry.register_stream(&id)?;
        let message = Message::StreamInvocation(StreamInvocationMessage {
            invocation_id: id.clone(),
            target: target.into(),
            arguments,
            headers: None,
        });

        if let Err(e) = self.inner.send_message(&message).await {
            self.inner.registry.discard(&id);
            return Err(e);
        }

        Ok(InvocationStream {
            inner: self.inner.clone(),
            invocation_id: id,
            rx,
            done: false,
        })
    }

    /// Start a client-to-server stream on `target`.
    pub async fn client_stream(&self, target: impl Into<String>) -> Result<ClientStream> {
        self.inner.ensure_connected()?;

        let id = self.inner.registry.next_invocation_id();
        let message = Message::Invocation(InvocationMessage {
            invocation_id: None,
            target: target.into(),
            arguments: vec![],
            stream_ids: Some(vec![id.clone()]),
            headers: None,
        });
        self.inner.send_message(&message).await?;

        Ok(ClientStream {
            inner: self.inner.clone(),
            invocation_id: id,
        })
    }

    /// Drive the connection to completion: negotiation, handshake, read and
    /// keep-alive loops, reconnection. Returns `Ok(())` only after
    /// [`close`](SignalRClient::close) (or a clean server-directed close);
    /// terminal negotiation/auth/handshake errors and an exhausted retry
    /// policy propagate.
    pub async fn run(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Closed => return Err(SignalRError::Closed),
            _ => {
                return Err(SignalRError::Connection(
                    "client is already running".to_string(),
                ))
            }
        }
        connection::run_connection(self.inner.clone()).await
    }

    /// Close the client: cancels the connection loops, closes the transport
    /// and fails every pending invocation. Idempotent and safe to call from
    /// any handler.
    pub fn close(&self) {
        if self.inner.is_closed() {
            return;
        }
        info!("closing client");
        let _ = self.inner.shutdown.send(true);
        if let Some(tx) = self.inner.outbound.lock().take() {
            let _ = tx.try_send(Outbound::Close);
        }
        self.inner.registry.fail_all();
        self.inner.set_state(ConnectionState::Closed);
    }
}

/// Sends a `CancelInvocation` when an `invoke` future is dropped before its
/// completion arrived.
struct CancelGuard {
    inner: Arc<ClientInner>,
    invocation_id: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed && self.inner.registry.is_outstanding(&self.invocation_id) {
            self.inner.spawn_cancel(self.invocation_id.clone());
        }
    }
}

/// Items produced by a server-to-client stream; ends at the completion.
pub struct InvocationStream {
    inner: Arc<ClientInner>,
    invocation_id: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl InvocationStream {
    /// The invocation id backing this stream.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

impl Stream for InvocationStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(StreamEvent::Done(completion))) => {
                self.done = true;
                match completion.error {
                    Some(error) => Poll::Ready(Some(Err(SignalRError::Server(error)))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(SignalRError::Connection(
                    "connection closed before stream completion".into(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InvocationStream {
    fn drop(&mut self) {
        if !self.done && self.inner.registry.is_outstanding(&self.invocation_id) {
            self.inner.spawn_cancel(self.invocation_id.clone());
        }
    }
}

/// A client-to-server stream: push items, then complete.
pub struct ClientStream {
    inner: Arc<ClientInner>,
    invocation_id: String,
}

impl ClientStream {
    /// The stream id announced to the server.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Send the next item.
    pub async fn send(&self, item: Value) -> Result<()> {
        let message = Message::StreamItem(StreamItemMessage {
            invocation_id: self.invocation_id.clone(),
            item,
            headers: None,
        });
        self.inner.send_message(&message).await
    }

    /// Finish the stream with a void completion.
    pub async fn complete(self) -> Result<()> {
        let message = Message::Completion(CompletionMessage::void(self.invocation_id.clone()));
        self.inner.send_message(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_client() -> SignalRClient {
        SignalRClient::new(SignalRConfig::new("ws://localhost:5000/hub"))
    }

    #[test]
    fn test_initial_state() {
        let client = test_client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(*client.state_receiver().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let client = test_client();
        let result = client.send("Notify", vec![json!(1)]).await;
        assert!(matches!(result, Err(SignalRError::NotConnected)));
    }

    #[tokio::test]
    async fn test_invoke_not_connected() {
        let client = test_client();
        let result = client.invoke("Add", vec![json!(1), json!(2)]).await;
        assert!(matches!(result, Err(SignalRError::NotConnected)));
    }

    #[tokio::test]
    async fn test_stream_not_connected() {
        let client = test_client();
        let result = client.stream("Counter", vec![]).await;
        assert!(matches!(result, Err(SignalRError::NotConnected)));
    }

    #[tokio::test]
    async fn test_client_stream_not_connected() {
        let client = test_client();
        let result = client.client_stream("Upload").await;
        assert!(matches!(result, Err(SignalRError::NotConnected)));
    }

    #[tokio::test]
    async fn test_handler_replacement() {
        let client = test_client();
        client.on("event", |_args| async { Ok(Some(json!("first"))) });
        client.on("event", |_args| async { Ok(Some(json!("second"))) });

        let handler = client.inner.handlers.lock().get("event").cloned().unwrap();
        let result = handler(vec![]).await.unwrap();
        assert_eq!(result, Some(json!("second")));
        assert_eq!(client.inner.handlers.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_slots() {
        let client = test_client();
        client.on_open(|| async { Ok(()) });
        client.on_close(|| async { Ok(()) });
        client.on_error(|_c| async {});

        assert!(client.inner.open_handler.lock().is_some());
        assert!(client.inner.close_handler.lock().is_some());
        assert!(client.inner.error_handler.lock().is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = test_client();
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_run_after_close() {
        let client = test_client();
        client.close();
        assert!(matches!(client.run().await, Err(SignalRError::Closed)));
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let client = test_client();
        client.close();
        let result = client.send("Notify", vec![]).await;
        assert!(matches!(result, Err(SignalRError::Closed)));
    }
}
