//! Connection lifecycle
//!
//! Drives negotiation, the hub handshake, the read loop, the keep-alive
//! loop and the reconnection policy. One connected epoch runs three tasks:
//! the read loop (owned here), a writer task that serializes outbound
//! frames, and the keep-alive task. The first terminal event tears the
//! epoch down; the retry policy decides what happens next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::{ClientInner, ConnectionState};
use crate::error::{Result, SignalRError};
use crate::messages::{CompletionMessage, InvocationMessage, JsonMessage, Message};
use crate::transport::websocket::{self, FrameKind, Outbound, WsSink, WsSource};
use crate::utils;

/// Why a connected epoch ended.
enum EpochEnd {
    /// `close()` was called.
    Shutdown,
    /// The server sent a `Close` hub message.
    ServerClose {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },
    /// Transport loss, idle timeout or a decode failure.
    Lost(SignalRError),
}

/// Top-level driver behind `SignalRClient::run`.
pub(crate) async fn run_connection(inner: Arc<ClientInner>) -> Result<()> {
    let mut attempt: usize = 0;
    loop {
        if inner.is_closed() {
            inner.set_state(ConnectionState::Closed);
            return Ok(());
        }

        let failure = match connect_once(&inner).await {
            // dropping the fresh socket is the whole cleanup here
            Ok(_) if inner.is_closed() => {
                inner.set_state(ConnectionState::Closed);
                return Ok(());
            }
            Ok((sink, source, trailing)) => {
                attempt = 0;
                let end = run_epoch(&inner, sink, source, trailing).await;
                inner.fire_close().await;
                match end {
                    EpochEnd::Shutdown => {
                        inner.set_state(ConnectionState::Closed);
                        return Ok(());
                    }
                    EpochEnd::ServerClose {
                        error,
                        allow_reconnect,
                    } => {
                        if let Some(ref text) = error {
                            inner
                                .report_error(CompletionMessage::with_error(
                                    String::new(),
                                    text.clone(),
                                ))
                                .await;
                        }
                        if allow_reconnect == Some(false) {
                            inner.set_state(ConnectionState::Closed);
                            return match error {
                                Some(text) => Err(SignalRError::Server(text)),
                                None => Ok(()),
                            };
                        }
                        SignalRError::Connection(
                            error.unwrap_or_else(|| "server requested reconnect".to_string()),
                        )
                    }
                    EpochEnd::Lost(e) => e,
                }
            }
            Err(e) => e,
        };

        if inner.is_closed() {
            inner.set_state(ConnectionState::Closed);
            return Ok(());
        }
        if failure.is_fatal() {
            error!(error = %failure, "terminal connection failure");
            inner.set_state(ConnectionState::Disconnected);
            return Err(failure);
        }

        match inner.config.retry.delay(attempt) {
            Some(delay) => {
                attempt += 1;
                warn!(error = %failure, attempt, delay = ?delay, "connection lost; retrying");
                inner.set_state(ConnectionState::Reconnecting);
                let mut shutdown = inner.subscribe_shutdown();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        inner.set_state(ConnectionState::Closed);
                        return Ok(());
                    }
                }
            }
            None => {
                error!(error = %failure, attempts = attempt + 1, "retry policy exhausted");
                inner.set_state(ConnectionState::Disconnected);
                return Err(failure);
            }
        }
    }
}

/// One connection attempt: token refresh, negotiation, WebSocket open and
/// the hub handshake. Returns the split socket plus any hub messages that
/// arrived concatenated after the handshake response.
async fn connect_once(inner: &Arc<ClientInner>) -> Result<(WsSink, WsSource, Vec<Message>)> {
    inner.set_state(ConnectionState::Connecting);
    let config = &inner.config;

    let mut headers = config.headers.clone();
    if let Some(factory) = &config.access_token_factory {
        let token = factory().await?;
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let mut url = Url::parse(&config.url)
        .map_err(|e| SignalRError::Connection(format!("invalid url `{}`: {e}", config.url)))?;
    url = match url.scheme() {
        "http" | "https" => negotiate(inner, &url, &mut headers).await?,
        "ws" | "wss" => url,
        other => {
            return Err(SignalRError::Connection(format!(
                "unsupported url scheme `{other}`"
            )))
        }
    };

    let (mut sink, mut source) = websocket::connect(
        &url,
        &headers,
        config.tls.clone(),
        config.max_size,
        config.connection_timeout,
    )
    .await?;

    let trailing = if inner.protocol.requires_handshake() {
        inner.set_state(ConnectionState::Handshaking);
        perform_handshake(inner, &mut sink, &mut source).await?
    } else {
        Vec::new()
    };

    Ok((sink, source, trailing))
}

/// The negotiation POST for http(s) endpoints.
async fn negotiate(
    inner: &Arc<ClientInner>,
    url: &Url,
    headers: &mut HashMap<String, String>,
) -> Result<Url> {
    let negotiate_url = utils::negotiate_url(url)?;
    debug!(url = %negotiate_url, "negotiating");

    let client = reqwest::Client::builder()
        .timeout(inner.config.connection_timeout)
        .build()
        .map_err(|e| SignalRError::Negotiation(e.to_string()))?;

    let mut request = client.post(negotiate_url.as_str());
    for (name, value) in headers.iter() {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| SignalRError::Negotiation(e.to_string()))?;
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SignalRError::Authorization);
    }
    if !status.is_success() {
        return Err(SignalRError::Negotiation(format!(
            "negotiate returned {status}"
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| SignalRError::Negotiation(format!("invalid negotiate response: {e}")))?;

    // redirect response: connect elsewhere with a session-bound token
    if let (Some(redirect), Some(token)) = (
        body.get("url").and_then(Value::as_str),
        body.get("accessToken").and_then(Value::as_str),
    ) {
        info!("negotiation redirected");
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        let redirect = Url::parse(redirect)
            .map_err(|e| SignalRError::Negotiation(format!("invalid redirect url: {e}")))?;
        return utils::replace_scheme(redirect, true);
    }

    let id = body
        .get("connectionToken")
        .or_else(|| body.get("connectionId"))
        .and_then(Value::as_str);
    match id {
        Some(id) => {
            info!("negotiation completed");
            utils::connection_url(url, id)
        }
        None => Err(SignalRError::Negotiation(format!(
            "unrecognized negotiate response: {body}"
        ))),
    }
}

/// Send the handshake request and wait for the server's response. The
/// response must be the first data frame; hub messages concatenated after
/// it are returned for dispatch.
async fn perform_handshake(
    inner: &Arc<ClientInner>,
    sink: &mut WsSink,
    source: &mut WsSource,
) -> Result<Vec<Message>> {
    debug!("sending handshake");
    let request = websocket::to_ws_message(
        inner.protocol.handshake_request(),
        inner.protocol.transfer_format(),
    )?;
    sink.send(request)
        .await
        .map_err(|e| SignalRError::Connection(format!("handshake send failed: {e}")))?;

    let deadline = tokio::time::Instant::now() + inner.config.connection_timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, source.next())
            .await
            .map_err(|_| {
                SignalRError::Connection("timed out waiting for handshake response".to_string())
            })?;
        match frame {
            Some(Ok(ws_message)) => {
                *inner.last_recv.lock() = Instant::now();
                match websocket::frame_kind(ws_message) {
                    FrameKind::Data(bytes) => {
                        let (response, trailing) = inner.protocol.parse_handshake(&bytes)?;
                        if let Some(error) = response.error {
                            return Err(SignalRError::Handshake(error));
                        }
                        debug!(minor_version = ?response.minor_version, "handshake accepted");
                        return Ok(trailing);
                    }
                    FrameKind::Control => continue,
                    FrameKind::Closed(reason) => {
                        return Err(SignalRError::Connection(format!(
                            "websocket closed during handshake ({})",
                            reason.unwrap_or_default()
                        )));
                    }
                }
            }
            Some(Err(e)) => return Err(SignalRError::Connection(e.to_string())),
            None => {
                return Err(SignalRError::Connection(
                    "websocket closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// One connected epoch: spawn the writer and keep-alive tasks, dispatch
/// inbound messages in arrival order until something ends the epoch, then
/// tear everything down and fail the pending invocations.
async fn run_epoch(
    inner: &Arc<ClientInner>,
    sink: WsSink,
    mut source: WsSource,
    trailing: Vec<Message>,
) -> EpochEnd {
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
    *inner.outbound.lock() = Some(outbound_tx.clone());
    *inner.last_send.lock() = Instant::now();
    *inner.last_recv.lock() = Instant::now();
    inner.registry.reset();
    inner.set_state(ConnectionState::Connected);

    let writer = tokio::spawn(websocket::writer_loop(
        sink,
        outbound_rx,
        inner.protocol.transfer_format(),
        inner.last_send.clone(),
    ));

    let (abort_tx, mut abort_rx) = oneshot::channel::<SignalRError>();
    let keepalive: Option<JoinHandle<()>>;
    // keeps the abort channel pending when keep-alive is disabled
    let _abort_guard: Option<oneshot::Sender<SignalRError>>;
    if inner.protocol.requires_handshake() {
        keepalive = Some(tokio::spawn(keepalive_loop(
            inner.clone(),
            outbound_tx.clone(),
            abort_tx,
        )));
        _abort_guard = None;
    } else {
        keepalive = None;
        _abort_guard = Some(abort_tx);
    }

    let mut shutdown = inner.subscribe_shutdown();
    inner.fire_open().await;

    let mut end: Option<EpochEnd> = None;
    for message in trailing {
        if let Some(e) = dispatch(inner, message).await {
            end = Some(e);
            break;
        }
    }

    let end = match end {
        Some(end) => end,
        None => loop {
            if inner.is_closed() {
                break EpochEnd::Shutdown;
            }
            tokio::select! {
                _ = shutdown.changed() => break EpochEnd::Shutdown,
                aborted = &mut abort_rx => {
                    break EpochEnd::Lost(aborted.unwrap_or_else(|_| {
                        SignalRError::Connection("keep-alive task ended".to_string())
                    }));
                }
                frame = source.next() => match frame {
                    Some(Ok(ws_message)) => {
                        *inner.last_recv.lock() = Instant::now();
                        match websocket::frame_kind(ws_message) {
                            FrameKind::Data(bytes) => {
                                let messages = match inner.protocol.decode(&bytes) {
                                    Ok(messages) => messages,
                                    Err(e) => break EpochEnd::Lost(e),
                                };
                                let mut closed = None;
                                for message in messages {
                                    if let Some(e) = dispatch(inner, message).await {
                                        closed = Some(e);
                                        break;
                                    }
                                }
                                if let Some(e) = closed {
                                    break e;
                                }
                            }
                            FrameKind::Control => {}
                            FrameKind::Closed(reason) => {
                                let reason = reason.unwrap_or_else(|| "no close frame".to_string());
                                break EpochEnd::Lost(SignalRError::Connection(format!(
                                    "websocket closed by peer ({reason})"
                                )));
                            }
                        }
                    }
                    Some(Err(e)) => break EpochEnd::Lost(SignalRError::Connection(e.to_string())),
                    None => break EpochEnd::Lost(SignalRError::Connection(
                        "websocket stream ended".to_string(),
                    )),
                }
            }
        },
    };

    *inner.outbound.lock() = None;
    let _ = outbound_tx.try_send(Outbound::Close);
    if let Some(task) = keepalive {
        task.abort();
    }
    drop(outbound_tx);
    inner.registry.fail_all();
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    end
}

/// Route one decoded message. Returns `Some` when the message ends the
/// epoch (server `Close`).
async fn dispatch(inner: &Arc<ClientInner>, message: Message) -> Option<EpochEnd> {
    match message {
        // the frame itself already refreshed the activity clock
        Message::Ping => {}
        Message::Invocation(m) => handle_invocation(inner, m).await,
        Message::StreamItem(m) => {
            if !inner.registry.deliver_item(&m.invocation_id, m.item) {
                debug!(id = %m.invocation_id, "dropping stream item for unknown invocation");
            }
        }
        Message::Completion(m) => {
            let errored = m.error.is_some();
            if !inner.registry.complete(m.clone()) {
                debug!(id = %m.invocation_id, "completion for unknown invocation");
            }
            if errored {
                inner.report_error(m).await;
            }
        }
        Message::Close(m) => {
            info!(error = ?m.error, allow_reconnect = ?m.allow_reconnect, "server closed the connection");
            return Some(EpochEnd::ServerClose {
                error: m.error,
                allow_reconnect: m.allow_reconnect,
            });
        }
        Message::StreamInvocation(m) => {
            debug!(target = %m.target, "ignoring server-sent stream invocation");
        }
        Message::CancelInvocation(m) => {
            debug!(id = %m.invocation_id, "ignoring server-sent cancel invocation");
        }
        Message::Json(m) => handle_json(inner, m).await,
    }
    None
}

/// Invoke the registered handler. When the message carries an invocation id
/// the server expects a client result and gets a completion back; otherwise
/// handler errors go to `on_error` and are swallowed.
async fn handle_invocation(inner: &Arc<ClientInner>, message: InvocationMessage) {
    let handler = inner.handlers.lock().get(&message.target).cloned();
    let Some(handler) = handler else {
        debug!(target = %message.target, "no handler registered; dropping invocation");
        return;
    };

    let result = handler(message.arguments).await;
    match message.invocation_id {
        Some(id) => {
            let completion = match result {
                Ok(Some(value)) => CompletionMessage::with_result(id, value),
                Ok(None) => CompletionMessage::void(id),
                Err(error) => CompletionMessage::with_error(id, error),
            };
            if let Err(e) = inner.send_message(&Message::Completion(completion)).await {
                warn!(error = %e, "failed to send client result");
            }
        }
        None => {
            if let Err(error) = result {
                warn!(target = %message.target, error = %error, "event handler failed");
                inner
                    .report_error(CompletionMessage::with_error(String::new(), error))
                    .await;
            }
        }
    }
}

/// Frames from the plain JSON codec carry no hub target; route by the
/// frame's string `"type"` field, falling back to the `""` handler.
async fn handle_json(inner: &Arc<ClientInner>, message: JsonMessage) {
    let handler = {
        let handlers = inner.handlers.lock();
        message
            .data
            .get("type")
            .and_then(Value::as_str)
            .and_then(|key| handlers.get(key))
            .or_else(|| handlers.get(""))
            .cloned()
    };
    match handler {
        Some(handler) => {
            if let Err(error) = handler(vec![message.data]).await {
                inner
                    .report_error(CompletionMessage::with_error(String::new(), error))
                    .await;
            }
        }
        None => debug!("no handler for plain JSON frame"),
    }
}

/// Emit a ping whenever `ping_interval` passes without an outbound frame;
/// drop the connection when `connection_timeout` passes without an inbound
/// one.
async fn keepalive_loop(
    inner: Arc<ClientInner>,
    outbound: mpsc::Sender<Outbound>,
    abort: oneshot::Sender<SignalRError>,
) {
    let ping = match inner.protocol.encode(&Message::Ping) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "cannot encode ping; keep-alive disabled");
            return;
        }
    };
    let ping_interval = inner.config.ping_interval;
    let connection_timeout = inner.config.connection_timeout;

    let mut tick = tokio::time::interval(ping_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    tick.tick().await;

    loop {
        tick.tick().await;
        if inner.last_recv.lock().elapsed() >= connection_timeout {
            warn!(timeout = ?connection_timeout, "no inbound traffic; dropping connection");
            let _ = abort.send(SignalRError::Connection(format!(
                "connection timed out after {connection_timeout:?} without inbound traffic"
            )));
            return;
        }
        if inner.last_send.lock().elapsed() >= ping_interval
            && outbound.send(Outbound::Frame(ping.clone())).await.is_err()
        {
            return;
        }
    }
}
