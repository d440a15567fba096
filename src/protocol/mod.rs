//! Protocol codecs
//!
//! Bidirectional translation between hub messages and wire frames, plus the
//! handshake dialect. The connection manager accepts any [`HubProtocol`]
//! implementation; [`JsonHubProtocol`] is the default.

mod json;
mod plain;

pub use json::{JsonHubProtocol, RECORD_SEPARATOR};
pub use plain::PlainJsonProtocol;

use crate::error::Result;
use crate::messages::{HandshakeResponse, Message};

/// Whether frames travel as WebSocket text or binary messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// A hub protocol codec.
///
/// Implementations are stateless: a single instance serves every connection
/// epoch of a client.
pub trait HubProtocol: Send + Sync {
    /// Protocol name advertised during the handshake.
    fn name(&self) -> &'static str;

    /// Protocol version advertised during the handshake.
    fn version(&self) -> i32;

    /// Wire format of encoded frames.
    fn transfer_format(&self) -> TransferFormat;

    /// Whether connections using this codec perform the hub handshake and
    /// keep-alive exchange. Codecs for plain JSON endpoints opt out.
    fn requires_handshake(&self) -> bool {
        true
    }

    /// The handshake request frame sent first on every fresh connection.
    fn handshake_request(&self) -> Vec<u8>;

    /// Parse the first inbound frame as a handshake response. Hub messages
    /// concatenated after the response are decoded and returned for normal
    /// dispatch.
    fn parse_handshake(&self, raw: &[u8]) -> Result<(HandshakeResponse, Vec<Message>)>;

    /// Encode one message into a wire frame.
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    /// Decode a wire frame into the messages it carries, in order.
    fn decode(&self, raw: &[u8]) -> Result<Vec<Message>>;
}
