//! Terminal sessions: PTY process, output history, registry and reaper.

pub mod buffer;
pub mod pty;
pub mod reaper;
pub mod registry;
pub mod terminal;

pub use buffer::OutputBuffer;
pub use pty::{PtyProcess, ShellCommand};
pub use reaper::spawn_reaper;
pub use registry::{SessionRegistry, TeardownReason};
pub use terminal::{Attachment, SessionInfo, SessionPhase, TerminalSession};
