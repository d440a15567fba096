//! WebSocket transport adapter
//!
//! Opens the socket with merged handshake headers and an optional TLS
//! connector, converts WebSocket messages to byte frames, and runs the
//! writer task that serializes outbound frames onto the sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SignalRError};
use crate::protocol::TransferFormat;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, WsMessage>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// What a received WebSocket message means to the read loop.
pub(crate) enum FrameKind {
    /// A text or binary payload for the codec.
    Data(Vec<u8>),
    /// Ping/pong traffic; refreshes the activity clock only.
    Control,
    /// The peer closed the socket.
    Closed(Option<String>),
}

/// Frames queued for the writer task.
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Open a WebSocket to `url` with the given handshake headers, bounded by
/// `timeout`. Returns the split sink/stream pair.
pub(crate) async fn connect(
    url: &Url,
    headers: &HashMap<String, String>,
    tls: Option<Connector>,
    max_size: Option<usize>,
    timeout: Duration,
) -> Result<(WsSink, WsSource)> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SignalRError::Connection(format!("invalid websocket url: {e}")))?;

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SignalRError::Connection(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SignalRError::Connection(format!("invalid header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = max_size;
    ws_config.max_frame_size = max_size;

    debug!(url = %url, "opening websocket");
    let connect = connect_async_tls_with_config(request, Some(ws_config), false, tls);
    let (stream, _response) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| SignalRError::Connection(format!("connect timed out after {timeout:?}")))?
        .map_err(|e| SignalRError::Connection(e.to_string()))?;

    Ok(stream.split())
}

/// Classify a received WebSocket message.
pub(crate) fn frame_kind(message: WsMessage) -> FrameKind {
    match message {
        WsMessage::Text(text) => FrameKind::Data(text.as_bytes().to_vec()),
        WsMessage::Binary(bytes) => FrameKind::Data(bytes.into()),
        WsMessage::Ping(_) | WsMessage::Pong(_) => FrameKind::Control,
        WsMessage::Close(frame) => {
            FrameKind::Closed(frame.map(|f| format!("{}: {}", f.code, f.reason)))
        }
        WsMessage::Frame(_) => FrameKind::Control,
    }
}

/// Wrap an encoded frame in the WebSocket message kind the codec expects.
pub(crate) fn to_ws_message(bytes: Vec<u8>, format: TransferFormat) -> Result<WsMessage> {
    match format {
        TransferFormat::Text => {
            let text = String::from_utf8(bytes).map_err(|e| {
                SignalRError::Protocol(format!("text frame is not UTF-8: {e}"))
            })?;
            Ok(WsMessage::Text(text.into()))
        }
        TransferFormat::Binary => Ok(WsMessage::Binary(bytes.into())),
    }
}

/// Owns the sink for a connection epoch; one frame is fully written before
/// the next begins. Ends when asked to close, when every sender is gone, or
/// on the first write error.
pub(crate) async fn writer_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Outbound>,
    format: TransferFormat,
    last_send: Arc<Mutex<Instant>>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(bytes) => {
                let message = match to_ws_message(bytes, format) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable outbound frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "websocket send failed");
                    break;
                }
                *last_send.lock() = Instant::now();
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
}
