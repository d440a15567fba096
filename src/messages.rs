//! Hub message types
//!
//! Protocol-neutral in-memory form of every message the hub protocol
//! exchanges. Wire field names follow the SignalR JSON dialect (camelCase,
//! optional fields omitted when absent); the numeric `type` tag is applied
//! by the codec, not here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An invocation of a hub method.
///
/// Without an `invocation_id` no response is expected (fire-and-forget).
/// With `stream_ids` the invocation announces client-to-server streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// An invocation for which the server is expected to produce a stream of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInvocationMessage {
    pub invocation_id: String,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// A single item of an in-flight stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Terminates an invocation: a result, an error, or neither (void).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl CompletionMessage {
    /// A completion carrying a result value.
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: Some(result),
            error: None,
            headers: None,
        }
    }

    /// A completion carrying a server error.
    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
            headers: None,
        }
    }

    /// A void completion: neither result nor error.
    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
            headers: None,
        }
    }
}

/// Cancels an outstanding invocation on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocationMessage {
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Server-initiated connection close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// A frame exchanged by the plain JSON codec; not a hub message.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMessage {
    pub data: Value,
}

/// All messages flowing through the protocol codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invocation(InvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    StreamInvocation(StreamInvocationMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
    Json(JsonMessage),
}

/// First frame sent after the WebSocket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: i32,
}

/// The server's reply to a handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_serialization_minimal() {
        let msg = InvocationMessage {
            invocation_id: None,
            target: "Notify".to_string(),
            arguments: vec![json!({"x": 1})],
            stream_ids: None,
            headers: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"target":"Notify","arguments":[{"x":1}]}"#);
    }

    #[test]
    fn test_invocation_serialization_with_id() {
        let msg = InvocationMessage {
            invocation_id: Some("1".to_string()),
            target: "Add".to_string(),
            arguments: vec![json!(1), json!(2)],
            stream_ids: None,
            headers: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            text,
            r#"{"invocationId":"1","target":"Add","arguments":[1,2]}"#
        );
    }

    #[test]
    fn test_invocation_serialization_with_stream_ids() {
        let msg = InvocationMessage {
            invocation_id: None,
            target: "Upload".to_string(),
            arguments: vec![],
            stream_ids: Some(vec!["3".to_string()]),
            headers: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            text,
            r#"{"target":"Upload","arguments":[],"streamIds":["3"]}"#
        );
    }

    #[test]
    fn test_invocation_deserialization_missing_optionals() {
        let msg: InvocationMessage =
            serde_json::from_str(r#"{"target":"op","arguments":[{"x":1}]}"#).unwrap();
        assert_eq!(msg.invocation_id, None);
        assert_eq!(msg.target, "op");
        assert_eq!(msg.arguments, vec![json!({"x": 1})]);
        assert_eq!(msg.stream_ids, None);
    }

    #[test]
    fn test_stream_item_round_trip() {
        let msg = StreamItemMessage {
            invocation_id: "7".to_string(),
            item: json!(42),
            headers: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"invocationId":"7","item":42}"#);
        let back: StreamItemMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_completion_with_result() {
        let msg = CompletionMessage::with_result("1", json!(3));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"invocationId":"1","result":3}"#);
    }

    #[test]
    fn test_completion_with_error() {
        let msg = CompletionMessage::with_error("1", "boom");
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"invocationId":"1","error":"boom"}"#);
    }

    #[test]
    fn test_completion_void_omits_both() {
        let msg = CompletionMessage::void("9");
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"invocationId":"9"}"#);
    }

    #[test]
    fn test_close_deserialization() {
        let msg: CloseMessage =
            serde_json::from_str(r#"{"error":"shutting down","allowReconnect":true}"#).unwrap();
        assert_eq!(msg.error.as_deref(), Some("shutting down"));
        assert_eq!(msg.allow_reconnect, Some(true));
    }

    #[test]
    fn test_close_deserialization_empty() {
        let msg: CloseMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(msg.error, None);
        assert_eq!(msg.allow_reconnect, None);
    }

    #[test]
    fn test_cancel_invocation_serialization() {
        let msg = CancelInvocationMessage {
            invocation_id: "5".to_string(),
            headers: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"invocationId":"5"}"#
        );
    }

    #[test]
    fn test_handshake_request_serialization() {
        let msg = HandshakeRequest {
            protocol: "json".to_string(),
            version: 1,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"protocol":"json","version":1}"#
        );
    }

    #[test]
    fn test_handshake_response_deserialization() {
        let msg: HandshakeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(msg.error, None);

        let msg: HandshakeResponse =
            serde_json::from_str(r#"{"error":"bad proto","minorVersion":0}"#).unwrap();
        assert_eq!(msg.error.as_deref(), Some("bad proto"));
        assert_eq!(msg.minor_version, Some(0));
    }

    #[test]
    fn test_message_structural_equality() {
        let a = Message::Completion(CompletionMessage::with_result("1", json!(3)));
        let b = Message::Completion(CompletionMessage::with_result("1", json!(3)));
        assert_eq!(a, b);
        assert_ne!(a, Message::Ping);
    }
}
