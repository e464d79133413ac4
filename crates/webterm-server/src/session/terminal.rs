//! One shell session: PTY process, output history, attachment bookkeeping.
//!
//! Lifecycle: `Starting -> Ready -> Draining -> Terminated`. A dedicated
//! thread pumps PTY output through the sanitizer into the history buffer and
//! publishes the new end offset on a watch channel. Connections read deltas
//! from the buffer at their own pace.

use super::buffer::OutputBuffer;
use super::pty::{PtyProcess, ShellCommand};
use crate::config::TerminalOptions;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use webterm_core::{sanitize, wrap_inline, ServerMessage, WebTermError, WebTermResult};

/// Printed by the setup script once the shell has processed it. The script
/// prints it in two halves so the echoed command line never matches.
const READY_MARKER: &[u8] = b"__webterm_ready__";

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    Ready,
    Draining,
    Terminated,
}

/// Where a newly attached connection starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Absolute buffer offset of the first byte the connection still needs.
    pub offset: u64,
    /// History to send once before streaming (reconnects only).
    pub replay: Vec<u8>,
}

/// Point-in-time view of a session, for logging and the reaper.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub phase: SessionPhase,
    pub connections: usize,
    pub idle: Duration,
    pub age: Duration,
    pub output_bytes: u64,
}

struct SessionState {
    phase: SessionPhase,
    buffer: OutputBuffer,
    last_active: Instant,
    connections: usize,
}

/// A PTY-backed shell shared by any number of connections.
pub struct TerminalSession {
    id: String,
    process: PtyProcess,
    state: Mutex<SessionState>,
    /// End offset of the output buffer after the latest append.
    output_tx: watch::Sender<u64>,
    /// Fires once when teardown starts.
    done_tx: watch::Sender<bool>,
    /// Fires once when the shell exits on its own.
    exited_tx: watch::Sender<bool>,
    /// Set when setup timed out; the pump then stops discarding output.
    setup_abandoned: AtomicBool,
    created_at: Instant,
}

impl TerminalSession {
    /// Spawn the shell, run the setup phase and return a `Ready` session.
    pub async fn start(id: String, options: &TerminalOptions) -> WebTermResult<Arc<Self>> {
        let cmd = ShellCommand {
            shell: options.shell.clone(),
            env: options.env.clone(),
            rows: options.rows,
            cols: options.cols,
        };
        let (process, reader) = PtyProcess::spawn(&cmd)?;

        let now = Instant::now();
        let session = Arc::new(Self {
            id,
            process,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Starting,
                buffer: OutputBuffer::new(options.buffer_limit),
                last_active: now,
                connections: 0,
            }),
            output_tx: watch::channel(0).0,
            done_tx: watch::channel(false).0,
            exited_tx: watch::channel(false).0,
            setup_abandoned: AtomicBool::new(false),
            created_at: now,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let gate = options.setup.then_some(ready_tx);
        let pump_session = session.clone();
        std::thread::Builder::new()
            .name(format!("pty-pump-{}", session.id.chars().take(8).collect::<String>()))
            .spawn(move || pump_session.pump(reader, gate))
            .map_err(|e| WebTermError::Pty(format!("failed to start output pump: {e}")))?;

        if options.setup {
            if let Err(e) = session.run_setup(options) {
                let failed = session.clone();
                let _ = tokio::task::spawn_blocking(move || failed.process.terminate()).await;
                session.done_tx.send_replace(true);
                return Err(e);
            }
            session.await_setup(ready_rx, options.setup_timeout).await?;
        }

        session.state().phase = SessionPhase::Ready;
        info!(session_id = %session.id, "session ready");
        Ok(session)
    }

    fn run_setup(&self, options: &TerminalOptions) -> WebTermResult<()> {
        let script = setup_script(options.env.get("PS1").map(String::as_str));
        self.process.write(script.as_bytes())
    }

    async fn await_setup(
        self: &Arc<Self>,
        ready_rx: oneshot::Receiver<()>,
        limit: Duration,
    ) -> WebTermResult<()> {
        match tokio::time::timeout(limit, ready_rx).await {
            Ok(Ok(())) => {
                debug!(session_id = %self.id, "shell setup complete");
                Ok(())
            }
            Ok(Err(_)) => {
                let failed = self.clone();
                let _ = tokio::task::spawn_blocking(move || failed.process.terminate()).await;
                self.done_tx.send_replace(true);
                Err(WebTermError::Pty("shell exited during startup".into()))
            }
            Err(_) => {
                warn!(session_id = %self.id, timeout_ms = limit.as_millis() as u64, "shell setup marker not seen, continuing");
                self.setup_abandoned.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Blocking read loop; runs on its own thread until the PTY closes.
    fn pump(self: Arc<Self>, mut reader: Box<dyn Read + Send>, mut setup: Option<oneshot::Sender<()>>) {
        let mut buf = [0u8; 4096];
        let mut probe: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(session_id = %self.id, "PTY reached EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the shell side has closed.
                    debug!(session_id = %self.id, error = %e, "PTY read ended");
                    break;
                }
            };

            let data = match setup.take() {
                Some(ready) if !self.setup_abandoned.load(Ordering::Acquire) => {
                    probe.extend_from_slice(&buf[..n]);
                    match marker_end(&probe) {
                        Some(end) => {
                            let _ = ready.send(());
                            probe.split_off(end)
                        }
                        None => {
                            keep_tail(&mut probe, READY_MARKER.len());
                            setup = Some(ready);
                            continue;
                        }
                    }
                }
                _ => buf[..n].to_vec(),
            };
            self.append_output(&data);
        }
        self.on_shell_exit();
    }

    fn append_output(&self, data: &[u8]) {
        let clean = sanitize(data);
        if clean.is_empty() {
            return;
        }
        let end = {
            let mut state = self.state();
            state.buffer.append(&clean);
            state.last_active = Instant::now();
            state.buffer.end_offset()
        };
        self.output_tx.send_replace(end);
    }

    fn on_shell_exit(&self) {
        let end = {
            let mut state = self.state();
            if matches!(state.phase, SessionPhase::Draining | SessionPhase::Terminated) {
                return;
            }
            match wrap_inline(&ServerMessage::session_ended(&self.id)) {
                Ok(notice) => state.buffer.append(&notice),
                Err(e) => warn!(session_id = %self.id, error = %e, "failed to encode exit notice"),
            }
            state.last_active = Instant::now();
            info!(session_id = %self.id, attached = state.connections, "shell exited");
            state.buffer.end_offset()
        };
        self.output_tx.send_replace(end);
        self.exited_tx.send_replace(true);
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    /// Register a connection. `resume` selects the reconnect path, which
    /// replays the retained history; otherwise the connection starts at the
    /// oldest retained byte and receives everything through streaming.
    pub fn attach(&self, resume: bool) -> WebTermResult<Attachment> {
        let mut state = self.state();
        if state.phase != SessionPhase::Ready {
            return Err(WebTermError::SessionClosed(self.id.clone()));
        }
        state.connections += 1;
        state.last_active = Instant::now();
        let attachment = if resume {
            let (replay, _) = state.buffer.read_from(0);
            Attachment {
                offset: state.buffer.end_offset(),
                replay,
            }
        } else {
            Attachment {
                offset: state.buffer.start_offset(),
                replay: Vec::new(),
            }
        };
        info!(session_id = %self.id, attached = state.connections, resume, "client attached");
        Ok(attachment)
    }

    /// Unregister a connection. The session stays alive for reconnects.
    pub fn detach(&self) {
        let mut state = self.state();
        state.connections = state.connections.saturating_sub(1);
        state.last_active = Instant::now();
        info!(session_id = %self.id, attached = state.connections, "client detached");
    }

    pub fn touch(&self) {
        self.state().last_active = Instant::now();
    }

    /// Forward client keystrokes to the shell.
    pub fn write_input(&self, data: &[u8]) -> WebTermResult<()> {
        if self.phase() != SessionPhase::Ready {
            return Err(WebTermError::SessionClosed(self.id.clone()));
        }
        self.touch();
        self.process.write(data)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> WebTermResult<()> {
        self.touch();
        self.process.resize(rows, cols)
    }

    /// Retained output from `offset` on, with the offset actually served.
    pub fn read_output(&self, offset: u64) -> (Vec<u8>, u64) {
        self.state().buffer.read_from(offset)
    }

    /// Receiver that changes whenever output is appended.
    pub fn subscribe_output(&self) -> watch::Receiver<u64> {
        self.output_tx.subscribe()
    }

    /// Receiver that turns `true` once teardown has started.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Receiver that turns `true` when the shell exits on its own.
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exited_tx.subscribe()
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// True when nobody is attached and the session has been quiet for
    /// longer than `timeout`.
    pub fn is_idle_expired(&self, timeout: Duration) -> bool {
        let state = self.state();
        state.phase == SessionPhase::Ready
            && state.connections == 0
            && state.last_active.elapsed() > timeout
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            id: self.id.clone(),
            phase: state.phase,
            connections: state.connections,
            idle: state.last_active.elapsed(),
            age: self.created_at.elapsed(),
            output_bytes: state.buffer.end_offset(),
        }
    }

    /// Move to `Draining`. Returns false if teardown already began, so the
    /// caller that gets `true` owns the rest of the teardown.
    pub(crate) fn begin_teardown(&self) -> bool {
        let mut state = self.state();
        match state.phase {
            SessionPhase::Draining | SessionPhase::Terminated => false,
            SessionPhase::Starting | SessionPhase::Ready => {
                state.phase = SessionPhase::Draining;
                true
            }
        }
    }

    /// Like [`begin_teardown`](Self::begin_teardown), but only if the session
    /// is still idle-expired. The check and the phase change happen under one
    /// lock, so a concurrent `attach` either wins or fails.
    pub(crate) fn begin_idle_teardown(&self, timeout: Duration) -> bool {
        let mut state = self.state();
        let expired = state.phase == SessionPhase::Ready
            && state.connections == 0
            && state.last_active.elapsed() > timeout;
        if expired {
            state.phase = SessionPhase::Draining;
        }
        expired
    }

    /// Kill the shell and fire the done signal. Blocks while the shell is
    /// reaped, so call it off the async executor.
    pub(crate) fn shutdown_blocking(&self) {
        self.process.terminate();
        self.done_tx.send_replace(true);
    }

    pub(crate) fn mark_terminated(&self) {
        self.state().phase = SessionPhase::Terminated;
    }
}

/// Commands fed to the shell before it is handed to clients.
fn setup_script(ps1: Option<&str>) -> String {
    let mut script = String::from("stty echo onlcr icrnl opost\n");
    if let Some(ps1) = ps1 {
        script.push_str(&format!("export PS1='{}'\n", ps1.replace('\'', "'\\''")));
    }
    script.push_str("clear\n");
    let (head, tail) = READY_MARKER.split_at(READY_MARKER.len() / 2);
    script.push_str(&format!(
        "printf '%s%s\\n' '{}' '{}'\n",
        String::from_utf8_lossy(head),
        String::from_utf8_lossy(tail)
    ));
    script
}

/// Index just past the marker and its line ending, if the marker is present.
fn marker_end(probe: &[u8]) -> Option<usize> {
    let pos = probe
        .windows(READY_MARKER.len())
        .position(|w| w == READY_MARKER)?;
    let mut end = pos + READY_MARKER.len();
    while end < probe.len() && matches!(probe[end], b'\r' | b'\n') {
        end += 1;
    }
    Some(end)
}

/// Keep only the bytes that could still be the start of a split marker.
fn keep_tail(probe: &mut Vec<u8>, marker_len: usize) {
    let keep = marker_len.saturating_sub(1);
    if probe.len() > keep {
        probe.drain(..probe.len() - keep);
    }
}
