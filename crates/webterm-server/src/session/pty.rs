//! PTY wrapper using portable-pty.
//!
//! Spawns the shell under a pseudo-terminal with a fixed environment and
//! provides write, resize and terminate primitives. The output side is handed
//! out once at spawn time as a blocking reader; end-of-stream on that reader
//! is the only signal that the shell has gone away.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use webterm_core::{WebTermError, WebTermResult};

/// What to run and how big the terminal starts.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub shell: String,
    pub env: BTreeMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// A shell process attached to the slave side of a PTY.
pub struct PtyProcess {
    /// Master side, kept for resize operations.
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    size: Mutex<(u16, u16)>,
}

impl PtyProcess {
    /// Spawn the shell and return the process plus the PTY output reader.
    pub fn spawn(cmd: &ShellCommand) -> WebTermResult<(Self, Box<dyn Read + Send>)> {
        if cmd.shell.trim().is_empty() {
            return Err(WebTermError::Pty("empty shell path".into()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cmd.rows, cmd.cols))
            .map_err(|e| WebTermError::Pty(format!("failed to open PTY: {e}")))?;

        let mut builder = CommandBuilder::new(&cmd.shell);
        builder.env_clear();
        for (key, value) in &cmd.env {
            builder.env(key, value);
        }
        if let Some(home) = cmd.env.get("HOME") {
            builder.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| WebTermError::Pty(format!("failed to spawn {}: {e}", cmd.shell)))?;
        // The parent must not hold the slave open or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!(shell = %cmd.shell, pid, rows = cmd.rows, cols = cmd.cols, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WebTermError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WebTermError::Pty(format!("failed to take PTY writer: {e}")))?;

        let process = Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            pid,
            size: Mutex::new((cmd.rows, cmd.cols)),
        };
        Ok((process, reader))
    }

    /// Write input bytes to the shell.
    pub fn write(&self, data: &[u8]) -> WebTermResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| WebTermError::Pty("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Change the window size; the shell receives SIGWINCH.
    pub fn resize(&self, rows: u16, cols: u16) -> WebTermResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| WebTermError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| WebTermError::Pty(format!("PTY resize failed: {e}")))?;
        drop(master);
        if let Ok(mut size) = self.size.lock() {
            *size = (rows, cols);
        }
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    /// Current `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the shell and everything in its process group, then reap it.
    ///
    /// Sends SIGTERM to the group first. Interactive shells ignore SIGTERM, so
    /// the child killer follows up with a hang-up and, failing that, SIGKILL.
    /// Blocks for up to a few hundred milliseconds.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM to process group failed");
            }
        }

        let Ok(mut child) = self.child.lock() else {
            warn!("child lock poisoned, cannot reap shell");
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(code = status.exit_code(), "shell already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "try_wait failed"),
        }
        if let Err(e) = child.kill() {
            debug!(error = %e, "kill failed");
        }
        match child.wait() {
            Ok(status) => info!(code = status.exit_code(), "shell reaped"),
            Err(e) => warn!(error = %e, "wait failed"),
        }
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(rows: u16, cols: u16) -> ShellCommand {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("TERM".to_string(), "dumb".to_string());
        ShellCommand {
            shell: "/bin/sh".into(),
            env,
            rows,
            cols,
        }
    }

    /// Read until `needle` shows up or the deadline passes.
    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[test]
    fn spawn_write_and_read() {
        let (pty, mut reader) = PtyProcess::spawn(&sh(24, 80)).unwrap();
        assert!(pty.pid().is_some());
        pty.write(b"echo pty-$((40+2))\n").unwrap();
        let out = read_until(&mut reader, "pty-42");
        assert!(out.contains("pty-42"), "output: {out:?}");
        pty.terminate();
    }

    #[test]
    fn resize_is_visible_to_the_shell() {
        let (pty, mut reader) = PtyProcess::spawn(&sh(24, 80)).unwrap();
        pty.resize(40, 120).unwrap();
        assert_eq!(pty.size(), (40, 120));
        pty.write(b"stty size\n").unwrap();
        let out = read_until(&mut reader, "40 120");
        assert!(out.contains("40 120"), "output: {out:?}");
        pty.terminate();
    }

    #[test]
    fn terminate_ends_the_output_stream() {
        let (pty, mut reader) = PtyProcess::spawn(&sh(24, 80)).unwrap();
        pty.terminate();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => assert!(Instant::now() < deadline, "reader never reached EOF"),
            }
        }
    }

    #[test]
    fn missing_shell_fails_to_spawn() {
        let mut cmd = sh(24, 80);
        cmd.shell = "/nonexistent/shell".into();
        assert!(PtyProcess::spawn(&cmd).is_err());

        cmd.shell = "  ".into();
        assert!(PtyProcess::spawn(&cmd).is_err());
    }
}
