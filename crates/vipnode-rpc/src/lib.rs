//! vipnode RPC - Pool server over WebSocket.
//!
//! Each WebSocket connection becomes one bidirectional JSON-RPC session with
//! the pool's operations registered under `vipnode_`. Hosts answer the pool's
//! `vipnode_whitelist` callbacks over the same connection.

pub mod server;
pub mod ws;

pub use server::{router, start_server, AppState};
pub use ws::{WsCodec, WsReader, WsWriter};
