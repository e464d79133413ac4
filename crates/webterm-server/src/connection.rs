//! Per-connection protocol: authenticate, attach, replay, then stream.
//!
//! `connecting -> authenticating -> attached -> closed`. A connection never
//! tears its session down on exit; it only detaches.

use crate::auth::{AuthRateLimiter, TokenValidator};
use crate::config::TerminalOptions;
use crate::session::{Attachment, SessionRegistry, TerminalSession};
use crate::transport::{self, WsStream};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use webterm_core::{
    decode_client, encode_server, AuthRequest, ClientMessage, ServerMessage, WebTermError, WebTermResult,
};

const RATE_LIMITED: &str = "too many failed authentication attempts";

/// Shared state every connection needs.
pub struct ConnectionHandler {
    pub registry: Arc<SessionRegistry>,
    pub validator: Arc<dyn TokenValidator>,
    pub rate_limits: Arc<Mutex<AuthRateLimiter>>,
    pub terminal: TerminalOptions,
    pub auth_timeout: Duration,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Why authentication failed, and whether it counts against the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rejection {
    message: &'static str,
    counts_as_failure: bool,
}

impl Rejection {
    const fn protocol(message: &'static str) -> Self {
        Self { message, counts_as_failure: false }
    }

    const fn credential(message: &'static str) -> Self {
        Self { message, counts_as_failure: true }
    }
}

/// What the inbound side wants after handling one client message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// A frame of shell output.
#[derive(Debug, PartialEq, Eq)]
enum OutputFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl ConnectionHandler {
    /// Run one WebSocket connection to completion.
    pub async fn handle(&self, mut ws: WsStream, remote: SocketAddr) -> WebTermResult<()> {
        let result = self.serve(&mut ws, remote).await;
        transport::ws_close(&mut ws).await;
        result
    }

    async fn serve(&self, ws: &mut WsStream, remote: SocketAddr) -> WebTermResult<()> {
        let ip = remote.ip();
        let auth = match self.authenticate(ws, ip).await {
            Ok(auth) => auth,
            Err(rejection) => {
                warn!(remote = %remote, reason = rejection.message, "authentication failed");
                if rejection.counts_as_failure {
                    self.rate_limits.lock().await.record_failure(ip);
                }
                send_message(ws, &ServerMessage::auth_fail(rejection.message)).await?;
                return Err(WebTermError::AuthFailed(rejection.message.into()));
            }
        };

        let (session, attachment) = match self.resolve_session(auth.session_id.as_deref()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(remote = %remote, error = %e, "failed to create terminal");
                let msg = ServerMessage::auth_fail(format!("Failed to create terminal: {e}"));
                send_message(ws, &msg).await?;
                return Err(e);
            }
        };
        info!(remote = %remote, session_id = %session.id(), "client authenticated");

        let result = self.attached(ws, &session, attachment).await;
        session.detach();
        result
    }

    /// Read and validate the first message.
    async fn authenticate(&self, ws: &mut WsStream, ip: IpAddr) -> Result<AuthRequest, Rejection> {
        let data = match tokio::time::timeout(self.auth_timeout, transport::ws_recv(ws)).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
                return Err(Rejection::protocol("Failed to read authentication message"));
            }
        };
        if self.rate_limits.lock().await.is_blocked(&ip) {
            return Err(Rejection::protocol(RATE_LIMITED));
        }
        let auth = match decode_client(&data) {
            Some(ClientMessage::Auth(auth)) => auth,
            Some(_) => return Err(Rejection::protocol("Invalid message type")),
            None => return Err(Rejection::protocol("Invalid authentication format")),
        };
        if auth.token.is_empty() {
            return Err(Rejection::credential("Missing authentication token"));
        }
        if !self.validator.is_token_valid(&auth.token) {
            return Err(Rejection::credential("Invalid authentication token"));
        }
        Ok(auth)
    }

    /// Reattach to a live session or start a new one.
    async fn resolve_session(
        &self,
        requested: Option<&str>,
    ) -> WebTermResult<(Arc<TerminalSession>, Attachment)> {
        if let Some(id) = requested {
            match self.registry.lookup_ready(id).await {
                Ok(session) => match session.attach(true) {
                    Ok(attachment) => return Ok((session, attachment)),
                    Err(e) => info!(session_id = id, error = %e, "cannot resume, starting a new session"),
                },
                Err(e) => info!(session_id = id, error = %e, "cannot resume, starting a new session"),
            }
        }
        let session = self.registry.create(&self.terminal).await?;
        let attachment = session.attach(false)?;
        Ok((session, attachment))
    }

    /// Steady state: forward output and dispatch client messages until the
    /// session ends, the client leaves or the server stops.
    async fn attached(
        &self,
        ws: &mut WsStream,
        session: &Arc<TerminalSession>,
        attachment: Attachment,
    ) -> WebTermResult<()> {
        let mut output_rx = session.subscribe_output();
        let mut done_rx = session.subscribe_done();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        send_message(ws, &ServerMessage::auth_ok(session.id())).await?;

        let held = attachment.replay.len() - deliver(ws, &attachment.replay, false).await?;
        let mut offset = attachment.offset - held as u64;
        offset = flush(ws, session, offset, false).await?;

        if session.is_done() {
            flush(ws, session, offset, true).await?;
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session_id = %session.id(), "server shutting down, closing connection");
                    break;
                }
                res = done_rx.changed() => {
                    if res.is_ok() {
                        flush(ws, session, offset, true).await?;
                    }
                    debug!(session_id = %session.id(), "session ended, closing connection");
                    break;
                }
                res = output_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    offset = flush(ws, session, offset, false).await?;
                }
                incoming = transport::ws_recv(ws) => {
                    match incoming {
                        Ok(Some(data)) => {
                            if self.dispatch(ws, session, &data).await? == Flow::Close {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(session_id = %session.id(), "client closed connection");
                            break;
                        }
                        Err(e) => {
                            debug!(session_id = %session.id(), error = %e, "connection read failed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one inbound frame: control message or raw keystrokes.
    async fn dispatch(
        &self,
        ws: &mut WsStream,
        session: &Arc<TerminalSession>,
        data: &[u8],
    ) -> WebTermResult<Flow> {
        match decode_client(data) {
            Some(ClientMessage::Resize { rows, cols }) => {
                debug!(session_id = %session.id(), rows, cols, "resize requested");
                if let Err(e) = session.resize(rows, cols) {
                    warn!(session_id = %session.id(), error = %e, "resize failed");
                }
                Ok(Flow::Continue)
            }
            Some(ClientMessage::Terminate { session_id }) if session_id == session.id() => {
                let found = self.registry.terminate(&session_id).await;
                info!(session_id = %session_id, found, "terminate requested");
                send_message(ws, &ServerMessage::terminate_ack(session_id, found)).await?;
                Ok(Flow::Close)
            }
            Some(other) => {
                debug!(session_id = %session.id(), message = ?other, "ignoring control message");
                session.touch();
                Ok(Flow::Continue)
            }
            None => {
                if let Err(e) = session.write_input(data) {
                    warn!(session_id = %session.id(), error = %e, "PTY write failed");
                }
                Ok(Flow::Continue)
            }
        }
    }
}

async fn send_message(ws: &mut WsStream, msg: &ServerMessage) -> WebTermResult<()> {
    transport::ws_send_text(ws, encode_server(msg)?).await
}

/// Send everything buffered after `offset`. Returns the new offset.
async fn flush(
    ws: &mut WsStream,
    session: &TerminalSession,
    offset: u64,
    final_flush: bool,
) -> WebTermResult<u64> {
    let (data, from) = session.read_output(offset);
    if from > offset {
        debug!(session_id = %session.id(), skipped = from - offset, "output evicted before delivery");
    }
    let sent = deliver(ws, &data, final_flush).await?;
    Ok(from + sent as u64)
}

/// Send `data` as output frames and return how many bytes went out.
async fn deliver(ws: &mut WsStream, data: &[u8], final_flush: bool) -> WebTermResult<usize> {
    let mut sent = 0;
    while let Some((frame, len)) = next_frame(&data[sent..], final_flush) {
        match frame {
            OutputFrame::Text(text) => transport::ws_send_text(ws, text).await?,
            OutputFrame::Binary(bytes) => transport::ws_send_binary(ws, bytes).await?,
        }
        sent += len;
    }
    Ok(sent)
}

/// The next frame to send from `data` and the number of bytes it covers.
///
/// Valid UTF-8 goes out as text. An incomplete sequence at the end is held
/// back (`None`) unless this is the final flush; anything else that is not
/// UTF-8 goes out as binary.
fn next_frame(data: &[u8], final_flush: bool) -> Option<(OutputFrame, usize)> {
    if data.is_empty() {
        return None;
    }
    match std::str::from_utf8(data) {
        Ok(text) => Some((OutputFrame::Text(text.to_owned()), data.len())),
        Err(e) if e.error_len().is_some() => Some((OutputFrame::Binary(data.to_vec()), data.len())),
        Err(e) if e.valid_up_to() > 0 => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&data[..valid]).into_owned();
            Some((OutputFrame::Text(text), valid))
        }
        Err(_) if final_flush => Some((OutputFrame::Binary(data.to_vec()), data.len())),
        Err(_) => None,
    }
}
