//! Server configuration: TOML file + CLI overrides.

use crate::auth::generate_token;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use webterm_core::{WebTermError, WebTermResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub terminal: TerminalSection,
}

impl ConfigFile {
    /// Parse a config file from TOML text.
    pub fn parse(content: &str) -> WebTermResult<Self> {
        toml::from_str(content).map_err(|e| WebTermError::Other(format!("config parse error: {e}")))
    }
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub insecure: bool,
    /// Reaper period in seconds.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval: u64,
    /// Seconds a new connection has to send its auth message.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            ws_path: default_ws_path(),
            insecure: false,
            reaper_interval: default_reaper_interval(),
            auth_timeout: default_auth_timeout(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Extra or overriding environment variables for the shell.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds a detached session survives without activity.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
    #[serde(default = "default_true")]
    pub setup: bool,
    /// Milliseconds to wait for the shell setup marker.
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout: u64,
    /// Milliseconds between the shell-exit notice and teardown.
    #[serde(default = "default_exit_grace")]
    pub exit_grace: u64,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: None,
            rows: default_rows(),
            cols: default_cols(),
            env: BTreeMap::new(),
            session_timeout: default_session_timeout(),
            buffer_limit: default_buffer_limit(),
            setup: true,
            setup_timeout: default_setup_timeout(),
            exit_grace: default_exit_grace(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_auth_timeout() -> u64 {
    30
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_session_timeout() -> u64 {
    600
}
fn default_buffer_limit() -> usize {
    1024 * 1024
}
fn default_setup_timeout() -> u64 {
    3000
}
fn default_exit_grace() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

/// Shell used when neither the config nor the CLI names one.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// Minimal, deterministic shell environment.
///
/// Interactive startup files are the main source of stray escape sequences,
/// so only a fixed set of variables is passed plus `PATH`, `HOME` and `USER`
/// from the server process.
pub fn default_env() -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = [
        ("TERM", "xterm-256color"),
        ("PS1", "\\w $ "),
        ("PROMPT_COMMAND", ""),
        ("BASH_SILENCE_DEPRECATION_WARNING", "1"),
        ("LANG", "en_US.UTF-8"),
        ("COLORTERM", "truecolor"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for key in ["PATH", "HOME", "USER"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env
}

/// Per-session options handed to the session registry.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
    /// Inactivity allowed for a session with no attached connection.
    pub session_timeout: Duration,
    /// Maximum bytes of output retained for replay.
    pub buffer_limit: usize,
    /// Run the shell setup commands before the session accepts traffic.
    pub setup: bool,
    pub setup_timeout: Duration,
    pub exit_grace: Duration,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::from_section(TerminalSection::default())
    }
}

impl TerminalOptions {
    fn from_section(section: TerminalSection) -> Self {
        let mut env = default_env();
        env.extend(section.env);
        Self {
            shell: section.shell.unwrap_or_else(default_shell),
            rows: section.rows,
            cols: section.cols,
            env,
            session_timeout: Duration::from_secs(section.session_timeout),
            buffer_limit: section.buffer_limit,
            setup: section.setup,
            setup_timeout: Duration::from_millis(section.setup_timeout),
            exit_grace: Duration::from_millis(section.exit_grace),
        }
    }
}

/// Values supplied on the command line; `None` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub addr: Option<String>,
    pub token: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub shell: Option<String>,
    pub session_timeout: Option<u64>,
    pub insecure: bool,
}

/// Resolved server configuration (CLI overrides applied, defaults filled in).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub ws_path: String,
    pub token: String,
    /// True when `token` was generated at startup rather than configured.
    pub token_generated: bool,
    pub allowed_origins: Vec<String>,
    pub reaper_interval: Duration,
    pub auth_timeout: Duration,
    pub terminal: TerminalOptions,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> WebTermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: CliOverrides) -> WebTermResult<Self> {
        let addr_str = overrides.addr.unwrap_or(file.server.addr);
        let insecure = overrides.insecure || file.server.insecure;
        let addr = ensure_localhost_binding(parse_addr(&addr_str)?, insecure);

        let (token, token_generated) = match overrides
            .token
            .or(file.auth.token)
            .filter(|t| !t.is_empty())
        {
            Some(token) => (token, false),
            None => (generate_token(), true),
        };

        let allowed_origins = match overrides.allowed_origins {
            Some(origins) => origins,
            None => file.auth.allowed_origins,
        };
        let allowed_origins: Vec<String> = allowed_origins
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        let allowed_origins = if allowed_origins.is_empty() {
            default_origins(addr)
        } else {
            allowed_origins
        };

        let mut terminal_section = file.terminal;
        if let Some(shell) = overrides.shell {
            terminal_section.shell = Some(shell);
        }
        if let Some(timeout) = overrides.session_timeout {
            terminal_section.session_timeout = timeout;
        }

        let ws_path = if file.server.ws_path.starts_with('/') {
            file.server.ws_path
        } else {
            format!("/{}", file.server.ws_path)
        };

        Ok(Self {
            addr,
            ws_path,
            token,
            token_generated,
            allowed_origins,
            reaper_interval: Duration::from_secs(file.server.reaper_interval),
            auth_timeout: Duration::from_secs(file.server.auth_timeout),
            terminal: TerminalOptions::from_section(terminal_section),
        })
    }
}

/// Accepts `host:port`, `:port` and bare IPs with port.
fn parse_addr(s: &str) -> WebTermResult<SocketAddr> {
    let normalized = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else if let Some(port) = s.strip_prefix("localhost:") {
        format!("127.0.0.1:{port}")
    } else {
        s.to_string()
    };
    normalized
        .parse()
        .map_err(|e| WebTermError::Other(format!("invalid listen address {s:?}: {e}")))
}

/// Without `insecure`, plain-HTTP serving is restricted to loopback.
fn ensure_localhost_binding(addr: SocketAddr, insecure: bool) -> SocketAddr {
    if insecure || addr.ip().is_loopback() {
        return addr;
    }
    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    warn!(requested = %addr, bound = %local, "restricting listener to localhost (use --insecure to allow remote connections)");
    local
}

/// Origins a browser will present when it loads the UI from `addr`.
pub fn default_origins(addr: SocketAddr) -> Vec<String> {
    let port = addr.port();
    let hosts: Vec<String> = if addr.ip().is_unspecified() || addr.ip().is_loopback() {
        vec![format!("localhost:{port}"), format!("127.0.0.1:{port}")]
    } else {
        vec![addr.to_string()]
    };
    hosts
        .iter()
        .flat_map(|h| [format!("http://{h}"), format!("https://{h}")])
        .collect()
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.ws_path, "/ws");
        assert!(cfg.token_generated);
        assert_eq!(cfg.token.len(), 32);
        assert_eq!(cfg.terminal.rows, 24);
        assert_eq!(cfg.terminal.cols, 80);
        assert_eq!(cfg.terminal.session_timeout, Duration::from_secs(600));
        assert_eq!(cfg.reaper_interval, Duration::from_secs(60));
        assert_eq!(cfg.terminal.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert!(cfg
            .allowed_origins
            .contains(&"http://localhost:8080".to_string()));
    }

    #[test]
    fn file_values_and_env_merge() {
        let file = ConfigFile::parse(
            r#"
            [server]
            addr = "127.0.0.1:9000"
            ws_path = "term"

            [auth]
            token = "abc"
            allowed_origins = ["https://term.example.com"]

            [terminal]
            shell = "/bin/sh"
            rows = 40
            session_timeout = 5

            [terminal.env]
            TERM = "xterm"
            EDITOR = "vi"
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(cfg.addr.port(), 9000);
        assert_eq!(cfg.ws_path, "/term");
        assert_eq!(cfg.token, "abc");
        assert!(!cfg.token_generated);
        assert_eq!(cfg.allowed_origins, vec!["https://term.example.com"]);
        assert_eq!(cfg.terminal.shell, "/bin/sh");
        assert_eq!(cfg.terminal.rows, 40);
        assert_eq!(cfg.terminal.cols, 80);
        assert_eq!(cfg.terminal.session_timeout, Duration::from_secs(5));
        assert_eq!(cfg.terminal.env["TERM"], "xterm");
        assert_eq!(cfg.terminal.env["EDITOR"], "vi");
        assert_eq!(cfg.terminal.env["LANG"], "en_US.UTF-8");
    }

    #[test]
    fn cli_overrides_win() {
        let file = ConfigFile::parse("[auth]\ntoken = \"file\"\n").unwrap();
        let cfg = ServerConfig::resolve(
            file,
            CliOverrides {
                addr: Some("127.0.0.1:7000".into()),
                token: Some("cli".into()),
                allowed_origins: Some(vec![" http://a:1 ".into(), "".into()]),
                shell: Some("/bin/zsh".into()),
                session_timeout: Some(42),
                insecure: false,
            },
        )
        .unwrap();
        assert_eq!(cfg.addr.port(), 7000);
        assert_eq!(cfg.token, "cli");
        assert_eq!(cfg.allowed_origins, vec!["http://a:1"]);
        assert_eq!(cfg.terminal.shell, "/bin/zsh");
        assert_eq!(cfg.terminal.session_timeout, Duration::from_secs(42));
    }

    #[test]
    fn non_loopback_is_rewritten_unless_insecure() {
        let overrides = CliOverrides {
            addr: Some("0.0.0.0:8081".into()),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(ConfigFile::default(), overrides.clone()).unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:8081".parse::<SocketAddr>().unwrap());

        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            CliOverrides {
                insecure: true,
                ..overrides
            },
        )
        .unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:8081".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn short_addr_forms() {
        assert_eq!(parse_addr(":8080").unwrap().port(), 8080);
        assert!(parse_addr(":8080").unwrap().ip().is_unspecified());
        assert!(parse_addr("localhost:3000").unwrap().ip().is_loopback());
        assert!(parse_addr("not an addr").is_err());
    }

    #[test]
    fn default_origins_for_specific_host() {
        let origins = default_origins("10.0.0.5:8080".parse().unwrap());
        assert_eq!(
            origins,
            vec!["http://10.0.0.5:8080", "https://10.0.0.5:8080"]
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(ConfigFile::parse("[server\naddr = 1").is_err());
    }
}
