//! Client transport: WebSocket over plain TCP.

pub mod websocket;

pub use websocket::{accept, ws_close, ws_recv, ws_send_binary, ws_send_text, WsStream};
