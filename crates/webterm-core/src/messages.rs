//! WebSocket envelope types.
//!
//! Client messages are decoded leniently through [`ControlEnvelope`]: any JSON
//! object whose fields have compatible types is a control message, even when
//! its `type` is unknown. Everything else is raw terminal input.

use serde::{Deserialize, Serialize};

/// Human-readable text carried by the shell-exit notification.
pub const SHELL_EXITED: &str = "Shell process has exited";

/// Raw control envelope as sent by the browser client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    #[serde(rename = "type", default)]
    pub msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

impl ControlEnvelope {
    /// The `type` field, or `""` when absent.
    pub fn kind(&self) -> &str {
        self.msg_type.as_deref().unwrap_or("")
    }
}

/// First message of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Bearer token; empty when the client sent none.
    pub token: String,
    /// Session to reconnect to, if any.
    pub session_id: Option<String>,
}

/// A classified client control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    /// Resize with strictly positive dimensions.
    Resize { rows: u16, cols: u16 },
    Terminate { session_id: String },
    /// Decodable JSON that is none of the above.
    Other(ControlEnvelope),
}

impl From<ControlEnvelope> for ClientMessage {
    fn from(env: ControlEnvelope) -> Self {
        match env.kind() {
            "auth" => ClientMessage::Auth(AuthRequest {
                token: env.token.unwrap_or_default(),
                session_id: env.session_id.filter(|id| !id.is_empty()),
            }),
            "resize" => match (env.rows, env.cols) {
                (Some(rows), Some(cols)) if rows > 0 && cols > 0 => {
                    ClientMessage::Resize { rows, cols }
                }
                _ => ClientMessage::Other(env),
            },
            "terminate" => ClientMessage::Terminate {
                session_id: env.session_id.unwrap_or_default(),
            },
            _ => ClientMessage::Other(env),
        }
    }
}

/// Messages sent from the server to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    TerminateResponse {
        success: bool,
        message: String,
        session_id: String,
    },
    SessionEnded {
        success: bool,
        message: String,
        session_id: String,
    },
}

impl ServerMessage {
    pub fn auth_ok(session_id: impl Into<String>) -> Self {
        ServerMessage::AuthResponse {
            success: true,
            message: None,
            session_id: Some(session_id.into()),
        }
    }

    pub fn auth_fail(message: impl Into<String>) -> Self {
        ServerMessage::AuthResponse {
            success: false,
            message: Some(message.into()),
            session_id: None,
        }
    }

    /// Acknowledgment for a terminate request. `found` is false when the
    /// session was already being torn down.
    pub fn terminate_ack(session_id: impl Into<String>, found: bool) -> Self {
        let message = if found {
            "Session terminated"
        } else {
            "Session not found"
        };
        ServerMessage::TerminateResponse {
            success: found,
            message: message.into(),
            session_id: session_id.into(),
        }
    }

    pub fn session_ended(session_id: impl Into<String>) -> Self {
        ServerMessage::SessionEnded {
            success: false,
            message: SHELL_EXITED.into(),
            session_id: session_id.into(),
        }
    }
}
