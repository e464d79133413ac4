//! Core server: accepts TCP connections, upgrades them and hands them to the
//! connection handler.
//!
//! Owns the session registry, the auth collaborators and the reaper. The
//! reaper only runs while [`WebTermServer::run`] does, and every session is
//! torn down before `run` returns.

use crate::auth::{AuthRateLimiter, OriginPolicy, StaticToken, TokenValidator};
use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::session::{spawn_reaper, SessionRegistry};
use crate::transport::websocket;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};
use webterm_core::{WebTermError, WebTermResult};

pub struct WebTermServer {
    config: ServerConfig,
    origins: OriginPolicy,
    handler: ConnectionHandler,
}

impl WebTermServer {
    /// Create a server that checks tokens against `config.token`.
    pub fn new(config: ServerConfig) -> Self {
        let validator = Arc::new(StaticToken::new(config.token.clone()));
        Self::with_validator(config, validator)
    }

    /// Create a server with a custom token validator.
    pub fn with_validator(config: ServerConfig, validator: Arc<dyn TokenValidator>) -> Self {
        let origins = OriginPolicy::new(config.allowed_origins.iter().cloned());
        let handler = ConnectionHandler {
            registry: Arc::new(SessionRegistry::new()),
            validator,
            rate_limits: Arc::new(Mutex::new(AuthRateLimiter::default())),
            terminal: config.terminal.clone(),
            auth_timeout: config.auth_timeout,
            shutdown_tx: broadcast::channel(1).0,
        };
        Self {
            config,
            origins,
            handler,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> WebTermResult<TcpListener> {
        TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| WebTermError::Transport(format!("bind {} failed: {e}", self.config.addr)))
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.handler.registry.clone()
    }

    /// Serve connections from `listener` until `shutdown` resolves, then
    /// close every connection and tear down every session.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> WebTermResult<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let reaper = spawn_reaper(
            server.handler.registry.clone(),
            server.handler.rate_limits.clone(),
            server.config.reaper_interval,
            server.config.terminal.session_timeout,
        );

        let local = listener.local_addr()?;
        info!(
            addr = %local,
            ws_path = %server.config.ws_path,
            shell = %server.config.terminal.shell,
            "webterm-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let srv = server.clone();
                        tokio::spawn(async move { srv.handle_stream(stream, remote).await });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
            }
        }

        reaper.abort();
        let _ = server.handler.shutdown_tx.send(());
        server.handler.registry.shutdown_all().await;
        info!("webterm-server stopped");
        Ok(())
    }

    async fn handle_stream(&self, stream: TcpStream, remote: SocketAddr) {
        let ws = match websocket::accept(stream, remote, &self.origins, &self.config.ws_path).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %remote, error = %e, "upgrade rejected");
                return;
            }
        };
        debug!(remote = %remote, "WebSocket connection accepted");
        if let Err(e) = self.handler.handle(ws, remote).await {
            debug!(remote = %remote, error = %e, "connection ended with error");
        }
    }
}
