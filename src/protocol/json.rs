//! The JSON hub protocol, version 1
//!
//! Every JSON text on the wire is terminated by the 0x1E record separator;
//! a single transport frame may carry several texts. Messages are tagged
//! with a numeric `type` field.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SignalRError};
use crate::messages::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HandshakeRequest, HandshakeResponse,
    InvocationMessage, Message, StreamInvocationMessage, StreamItemMessage,
};
use crate::protocol::{HubProtocol, TransferFormat};

/// Terminates every JSON text on the wire.
pub const RECORD_SEPARATOR: u8 = 0x1E;

const SEPARATOR_CHAR: char = RECORD_SEPARATOR as char;

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const STREAM_INVOCATION: u64 = 4;
const CANCEL_INVOCATION: u64 = 5;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// The default SignalR codec: JSON texts with numeric type tags and 0x1E
/// record-separator framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub fn new() -> Self {
        Self
    }
}

/// Serialize a hub message to a JSON object carrying its numeric type tag.
pub(crate) fn to_tagged_value(message: &Message) -> Result<Value> {
    let (mut value, tag) = match message {
        Message::Invocation(m) => (serde_json::to_value(m)?, INVOCATION),
        Message::StreamItem(m) => (serde_json::to_value(m)?, STREAM_ITEM),
        Message::Completion(m) => (serde_json::to_value(m)?, COMPLETION),
        Message::StreamInvocation(m) => (serde_json::to_value(m)?, STREAM_INVOCATION),
        Message::CancelInvocation(m) => (serde_json::to_value(m)?, CANCEL_INVOCATION),
        Message::Ping => (Value::Object(Default::default()), PING),
        Message::Close(m) => (serde_json::to_value(m)?, CLOSE),
        Message::Json(m) => return Ok(m.data.clone()),
    };
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("type".to_string(), tag.into());
            Ok(value)
        }
        None => Err(SignalRError::Protocol(
            "hub message did not serialize to an object".to_string(),
        )),
    }
}

/// Parse one JSON object into a hub message. Unknown or missing `type` tags
/// yield `None`; the message is skipped for forward compatibility.
fn parse_tagged_value(value: Value) -> Result<Option<Message>> {
    let tag = value.get("type").and_then(Value::as_u64);
    let message = match tag {
        Some(INVOCATION) => {
            Message::Invocation(serde_json::from_value::<InvocationMessage>(value)?)
        }
        Some(STREAM_ITEM) => {
            Message::StreamItem(serde_json::from_value::<StreamItemMessage>(value)?)
        }
        Some(COMPLETION) => {
            let completion = serde_json::from_value::<CompletionMessage>(value)?;
            if completion.result.is_some() && completion.error.is_some() {
                return Err(SignalRError::Protocol(format!(
                    "completion for invocation {} carries both result and error",
                    completion.invocation_id
                )));
            }
            Message::Completion(completion)
        }
        Some(STREAM_INVOCATION) => {
            Message::StreamInvocation(serde_json::from_value::<StreamInvocationMessage>(value)?)
        }
        Some(CANCEL_INVOCATION) => {
            Message::CancelInvocation(serde_json::from_value::<CancelInvocationMessage>(value)?)
        }
        Some(PING) => Message::Ping,
        Some(CLOSE) => Message::Close(serde_json::from_value::<CloseMessage>(value)?),
        other => {
            debug!(tag = ?other, "ignoring message with unknown type tag");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> i32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn handshake_request(&self) -> Vec<u8> {
        let request = HandshakeRequest {
            protocol: self.name().to_string(),
            version: self.version(),
        };
        // serializing a two-field struct cannot fail
        let mut bytes = serde_json::to_vec(&request).unwrap_or_default();
        bytes.push(RECORD_SEPARATOR);
        bytes
    }

    fn parse_handshake(&self, raw: &[u8]) -> Result<(HandshakeResponse, Vec<Message>)> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| SignalRError::Handshake(format!("handshake frame is not UTF-8: {e}")))?;
        let idx = text.find(SEPARATOR_CHAR).ok_or_else(|| {
            SignalRError::Handshake("handshake response missing record separator".to_string())
        })?;
        let response: HandshakeResponse = serde_json::from_str(&text[..idx])
            .map_err(|e| SignalRError::Handshake(format!("malformed handshake response: {e}")))?;
        let rest = &text[idx + 1..];
        let messages = if rest.is_empty() {
            Vec::new()
        } else {
            self.decode(rest.as_bytes())?
        };
        Ok((response, messages))
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let value = to_tagged_value(message)?;
        let mut bytes = serde_json::to_vec(&value)?;
        bytes.push(RECORD_SEPARATOR);
        Ok(bytes)
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Message>> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| SignalRError::Protocol(format!("frame is not UTF-8: {e}")))?;

        let mut messages = Vec::new();
        let mut rest = text;
        while let Some(idx) = rest.find(SEPARATOR_CHAR) {
            let piece = &rest[..idx];
            rest = &rest[idx + 1..];
            if piece.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(piece)
                .map_err(|e| SignalRError::Protocol(format!("invalid JSON text: {e}")))?;
            if let Some(message) = parse_tagged_value(value)? {
                messages.push(message);
            }
        }
        if !rest.is_empty() {
            return Err(SignalRError::Protocol(
                "partial JSON text before end of frame".to_string(),
            ));
        }
        Ok(messages)
    }
}
