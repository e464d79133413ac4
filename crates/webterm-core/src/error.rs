use thiserror::Error;

/// Errors produced by the webterm protocol and session layers.
#[derive(Debug, Error)]
pub enum WebTermError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for WebTermError {
    fn from(e: serde_json::Error) -> Self {
        WebTermError::Codec(e.to_string())
    }
}

pub type WebTermResult<T> = Result<T, WebTermError>;
