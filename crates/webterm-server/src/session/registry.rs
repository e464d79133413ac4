//! Session registry.
//!
//! Maps session ids to live sessions and owns teardown. The map lock is only
//! held for inserts, removals and lookups; process shutdown runs after the
//! entry is gone.

use super::terminal::{SessionPhase, TerminalSession};
use crate::config::TerminalOptions;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webterm_core::{WebTermError, WebTermResult};

/// Why a session is being torn down. Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// A client sent `terminate`.
    Requested,
    /// The shell exited on its own.
    ShellExit,
    /// No connections and idle past the session timeout.
    Idle,
    /// The server is stopping.
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::ShellExit => "shell exit",
            Self::Idle => "idle timeout",
            Self::Shutdown => "shutdown",
        })
    }
}

/// All live sessions, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    /// Set by `shutdown_all`; no session is registered afterwards.
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session under a fresh id and register it.
    ///
    /// A spawn or setup failure leaves nothing registered. Fails once
    /// `shutdown_all` has started.
    pub async fn create(self: &Arc<Self>, options: &TerminalOptions) -> WebTermResult<Arc<TerminalSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(shutting_down());
        }
        let id = generate_session_id();
        let session = TerminalSession::start(id.clone(), options).await?;
        {
            let mut sessions = self.sessions.write().await;
            if self.closed.load(Ordering::Acquire) {
                drop(sessions);
                self.teardown(&session, TeardownReason::Shutdown).await;
                return Err(shutting_down());
            }
            sessions.insert(id.clone(), session.clone());
        }
        info!(session_id = %id, shell = %options.shell, "session created");
        self.watch_exit(&session, options.exit_grace);
        Ok(session)
    }

    /// Tear the session down shortly after its shell exits, giving attached
    /// connections `grace` to deliver the exit notice.
    fn watch_exit(self: &Arc<Self>, session: &Arc<TerminalSession>, grace: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let session = session.clone();
        let mut exited = session.subscribe_exit();
        let mut done = session.subscribe_done();
        tokio::spawn(async move {
            let shell_exited = async { exited.wait_for(|e| *e).await.is_ok() };
            let torn_down = async {
                let _ = done.wait_for(|d| *d).await;
            };
            tokio::select! {
                true = shell_exited => {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.teardown(&session, TeardownReason::ShellExit).await;
                    }
                }
                _ = torn_down => {}
            }
        });
    }

    /// Any registered session with this id, whatever its phase.
    pub async fn lookup(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// A session that can still accept connections.
    pub async fn lookup_ready(&self, id: &str) -> WebTermResult<Arc<TerminalSession>> {
        let session = self
            .lookup(id)
            .await
            .ok_or_else(|| WebTermError::SessionNotFound(id.to_string()))?;
        if session.phase() != SessionPhase::Ready {
            return Err(WebTermError::SessionClosed(id.to_string()));
        }
        Ok(session)
    }

    /// Drop the entry for `session` if it is still the registered one.
    async fn remove(&self, session: &Arc<TerminalSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                debug!(session_id = %session.id(), remaining = sessions.len(), "session removed");
                true
            }
            _ => false,
        }
    }

    /// Client-requested termination. Returns false when the id is unknown
    /// or teardown is already under way.
    pub async fn terminate(&self, id: &str) -> bool {
        match self.lookup(id).await {
            Some(session) => self.teardown(&session, TeardownReason::Requested).await,
            None => false,
        }
    }

    /// Remove the session, kill its shell and fire its done signal.
    ///
    /// Only the first caller does the work; later calls return false.
    pub async fn teardown(&self, session: &Arc<TerminalSession>, reason: TeardownReason) -> bool {
        if !session.begin_teardown() {
            return false;
        }
        self.finish_teardown(session, reason).await;
        true
    }

    /// The rest of teardown, once the caller has moved the session to
    /// `Draining`.
    async fn finish_teardown(&self, session: &Arc<TerminalSession>, reason: TeardownReason) {
        self.remove(session).await;

        let dying = session.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || dying.shutdown_blocking()).await {
            warn!(session_id = %session.id(), error = %e, "shell shutdown task failed");
        }
        session.mark_terminated();
        let info = session.info();
        info!(
            session_id = %session.id(),
            %reason,
            age_secs = info.age.as_secs(),
            output_bytes = info.output_bytes,
            "session terminated"
        );
    }

    /// Tear down every session with no connections that has been idle for
    /// longer than `timeout`. Returns the ids that were reaped.
    ///
    /// Each candidate is re-checked as it is claimed, so one that gains a
    /// connection after the scan is left alone.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<String> {
        let expired: Vec<Arc<TerminalSession>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_idle_expired(timeout))
            .cloned()
            .collect();

        let mut reaped = Vec::new();
        for session in expired {
            let idle_secs = session.info().idle.as_secs();
            if !session.begin_idle_teardown(timeout) {
                debug!(session_id = %session.id(), "session became active, not reaping");
                continue;
            }
            self.finish_teardown(&session, TeardownReason::Idle).await;
            info!(session_id = %session.id(), idle_secs, "session reaped");
            reaped.push(session.id().to_string());
        }
        reaped
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Tear down everything. Used when the server stops.
    pub async fn shutdown_all(&self) {
        let all: Vec<Arc<TerminalSession>> = {
            let sessions = self.sessions.write().await;
            self.closed.store(true, Ordering::Release);
            sessions.values().cloned().collect()
        };
        if all.is_empty() {
            return;
        }
        info!(count = all.len(), "tearing down all sessions");
        let teardowns = all
            .iter()
            .map(|s| self.teardown(s, TeardownReason::Shutdown));
        futures_util::future::join_all(teardowns).await;
    }
}

fn shutting_down() -> WebTermError {
    WebTermError::Other("server is shutting down".into())
}

/// 128 random bits, hex encoded.
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
