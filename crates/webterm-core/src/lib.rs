//! webterm-core: Shared protocol library for the browser terminal bridge.
//!
//! Provides the JSON envelope types exchanged over the WebSocket, the inline
//! notification wrapper used inside the output stream, the output sanitizer
//! and the error taxonomy shared by the server.

pub mod codec;
pub mod error;
pub mod messages;
pub mod sanitize;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode_server, parse_inline, wrap_inline, JSON_CLOSE, JSON_OPEN};
pub use error::{WebTermError, WebTermResult};
pub use messages::{AuthRequest, ClientMessage, ControlEnvelope, ServerMessage, SHELL_EXITED};
pub use sanitize::sanitize;
