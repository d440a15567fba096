//! Transport adapters
//!
//! Thin bytes-in/bytes-out wrappers over the underlying socket. The only
//! transport is WebSocket; the connection manager owns its lifecycle.

pub(crate) mod websocket;
