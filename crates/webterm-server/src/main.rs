//! webterm-server: browser terminal bridge.
//!
//! Serves a WebSocket endpoint that authenticates browser clients with a
//! bearer token and attaches them to PTY-backed shell sessions.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use webterm_server::{CliOverrides, ServerConfig, WebTermServer};

/// webterm-server: browser terminal bridge
#[derive(Parser, Debug)]
#[command(name = "webterm-server", version, about = "Browser terminal bridge")]
struct Cli {
    /// Listen address (host:port or :port)
    #[arg(long)]
    addr: Option<String>,

    /// Access token clients must present (generated when not set)
    #[arg(long)]
    token: Option<String>,

    /// Allowed browser origins, comma separated
    #[arg(long, value_delimiter = ',')]
    allowed_origins: Option<Vec<String>>,

    /// Shell to run for each session
    #[arg(long)]
    shell: Option<String>,

    /// Seconds an unattached session survives before it is reaped
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Allow binding to non-loopback addresses
    #[arg(long)]
    insecure: bool,

    /// Config file path
    #[arg(long, default_value = "~/.webterm/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = ?e, "webterm-server failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting webterm-server");

    let overrides = CliOverrides {
        addr: cli.addr,
        token: cli.token,
        allowed_origins: cli.allowed_origins,
        shell: cli.shell,
        session_timeout: cli.session_timeout,
        insecure: cli.insecure,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    if config.token_generated {
        println!("Access token: {}", config.token);
    }
    if config.addr.ip().is_unspecified() {
        warn!(addr = %config.addr, "listening on all interfaces");
    }

    let server = WebTermServer::new(config);
    let listener = server.bind().await.context("failed to bind listener")?;
    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
