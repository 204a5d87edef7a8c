//! Error type shared by every harness component.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;
use crate::stream::StreamKind;

/// Errors surfaced by a [`crate::HarnessSession`] and its components.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The per-session temporary directory could not be created.
    #[error("failed to create session working directory")]
    WorkDir(#[source] std::io::Error),

    /// Writing the config file failed. Fatal to the session.
    #[error("failed to write config file {}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to start the executable (missing, not executable, ...).
    #[error("failed to spawn {}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading from a captured stream failed with something other than EOF.
    ///
    /// Capture units log this and stop; it never reaches the caller.
    #[error("error reading {stream}")]
    Read {
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },

    /// No captured line contained the substring before the deadline.
    #[error("timed out after {timeout:?} waiting for {substring:?} on {stream}\n{captured}")]
    Timeout {
        stream: StreamKind,
        substring: String,
        timeout: Duration,
        captured: CapturedLines,
    },

    /// The stream closed (the process exited) without a matching line.
    #[error(
        "{stream} closed after {elapsed:?} (timeout {timeout:?}) without a line containing {substring:?}; the process has exited\n{captured}"
    )]
    StreamClosed {
        stream: StreamKind,
        substring: String,
        elapsed: Duration,
        timeout: Duration,
        captured: CapturedLines,
    },

    /// The process did not exit on its own within the given time.
    #[error("process did not exit within {timeout:?}")]
    ExitTimeout { timeout: Duration },

    /// Killing or reaping the process failed.
    #[error("failed to stop process")]
    Stop(#[source] std::io::Error),

    /// An operation was called in the wrong lifecycle state.
    #[error("cannot {operation} a session in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

/// Snapshot of one stream's log, attached to failed waits for triage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLines {
    pub stream: StreamKind,
    pub lines: Vec<String>,
}

impl fmt::Display for CapturedLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--- captured {} ({} lines) ---",
            self.stream,
            self.lines.len()
        )?;
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        write!(f, "--- end of {} ---", self.stream)
    }
}
