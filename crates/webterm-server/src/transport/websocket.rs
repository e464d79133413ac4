//! WebSocket upgrade and frame helpers using tokio-tungstenite.
//!
//! The upgrade checks the request path and the `Origin` header before the
//! handshake completes, so rejected browsers get a plain HTTP error.

use crate::auth::OriginPolicy;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use webterm_core::{WebTermError, WebTermResult};

pub type WsStream = WebSocketStream<TcpStream>;

/// Maximum accepted client frame (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Complete the WebSocket handshake for a freshly accepted TCP stream.
///
/// Requests for any path other than `ws_path` get 404; requests from an
/// origin outside `origins` get 403.
pub async fn accept(
    stream: TcpStream,
    remote: SocketAddr,
    origins: &OriginPolicy,
    ws_path: &str,
) -> WebTermResult<WsStream> {
    let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if path != ws_path {
            debug!(remote = %remote, path, "upgrade for unknown path");
            return Err(error_response(StatusCode::NOT_FOUND, "not found"));
        }
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        if !origins.is_allowed(origin) {
            warn!(remote = %remote, origin = origin.unwrap_or(""), "origin rejected");
            return Err(error_response(StatusCode::FORBIDDEN, "origin not allowed"));
        }
        Ok(resp)
    };

    tokio_tungstenite::accept_hdr_async(stream, check)
        .await
        .map_err(|e| WebTermError::Transport(format!("WS handshake failed: {e}")))
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Send a text frame.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> WebTermResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| WebTermError::Transport(format!("WS send failed: {e}")))
}

/// Send a binary frame.
pub async fn ws_send_binary(ws: &mut WsStream, data: Vec<u8>) -> WebTermResult<()> {
    ws.send(Message::Binary(data))
        .await
        .map_err(|e| WebTermError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next data frame, text or binary, as raw bytes.
///
/// Returns `None` once the peer closes. Pings are answered here.
pub async fn ws_recv(ws: &mut WsStream) -> WebTermResult<Option<Vec<u8>>> {
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(WebTermError::Transport(format!("WS recv failed: {e}")));
            }
        };
        if data.len() > MAX_WS_FRAME_SIZE {
            return Err(WebTermError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                data.len()
            )));
        }
        return Ok(Some(data));
    }
}

/// Best-effort close handshake.
pub async fn ws_close(ws: &mut WsStream) {
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WS close failed");
    }
}
