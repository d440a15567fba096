//! Plain JSON codec for non-SignalR endpoints
//!
//! Exchanges one whole JSON object per WebSocket text frame: no record
//! separator, no handshake, no keep-alive pings. Inbound frames surface as
//! [`Message::Json`] and are routed by the client to the handler registered
//! under the frame's string `"type"` field, falling back to the handler
//! registered under `""`.

use serde_json::Value;

use crate::error::{Result, SignalRError};
use crate::messages::{HandshakeResponse, JsonMessage, Message};
use crate::protocol::json::to_tagged_value;
use crate::protocol::{HubProtocol, TransferFormat};

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainJsonProtocol;

impl PlainJsonProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl HubProtocol for PlainJsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> i32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn requires_handshake(&self) -> bool {
        false
    }

    fn handshake_request(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse_handshake(&self, _raw: &[u8]) -> Result<(HandshakeResponse, Vec<Message>)> {
        Ok((HandshakeResponse::default(), Vec::new()))
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let value = to_tagged_value(message)?;
        Ok(serde_json::to_vec(&value)?)
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Message>> {
        let data: Value = serde_json::from_slice(raw)
            .map_err(|e| SignalRError::Protocol(format!("invalid JSON frame: {e}")))?;
        Ok(vec![Message::Json(JsonMessage { data })])
    }
}
