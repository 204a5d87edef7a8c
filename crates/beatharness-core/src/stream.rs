//! Per-stream captured output.
//!
//! Each output stream of the supervised process gets its own [`StreamLog`]:
//! an append-only list of lines plus the read cursor used by
//! [`crate::PatternWaiter`]. Lines, cursor and the closed flag live behind a
//! single mutex so that an append and a scan-plus-advance never interleave.

use std::fmt;
use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// One of the two textual output channels of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct LogState {
    lines: Vec<String>,
    /// Index of the first line not yet consumed by a match.
    cursor: usize,
    /// Set once the capture unit observed end-of-stream, or capture was
    /// shut down with the process.
    closed: bool,
    /// Set when capture stopped on a read error while the stream was still
    /// open. No further lines will arrive, but the process may be alive.
    failed: bool,
}

/// Outcome of a single scan pass over a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// A line matched; the cursor now points just past it.
    Matched(String),
    /// Nothing matched in `..scanned_to`.
    Pending { scanned_to: usize, closed: bool },
}

/// Append-only, synchronized log of one stream's lines.
#[derive(Debug)]
pub struct StreamLog {
    kind: StreamKind,
    state: Mutex<LogState>,
    changed: Notify,
}

impl StreamLog {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            state: Mutex::new(LogState::default()),
            changed: Notify::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    // Appends never leave the state half-written, so a poisoned lock still
    // guards consistent data.
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line and wake any pending waiters.
    ///
    /// Lines pushed after [`StreamLog::close`] are dropped.
    pub fn push(&self, line: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.lines.push(line.into());
        }
        self.changed.notify_waiters();
    }

    /// Mark end-of-stream. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Record that capture stopped on a read error. Unlike
    /// [`StreamLog::close`] this does not claim the process is gone, so
    /// waiters keep running until their deadline.
    pub fn mark_failed(&self) {
        self.lock().failed = true;
        self.changed.notify_waiters();
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    /// Copy of every line captured so far.
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Copy of the lines in `range`, clamped to the current length.
    pub fn slice(&self, range: Range<usize>) -> Vec<String> {
        let state = self.lock();
        let end = range.end.min(state.lines.len());
        let start = range.start.min(end);
        state.lines[start..end].to_vec()
    }

    /// Whether any captured line contains `substring`, ignoring the cursor.
    pub fn contains(&self, substring: &str) -> bool {
        self.lock().lines.iter().any(|line| line.contains(substring))
    }

    /// Scan from `max(from, cursor)` for the first line containing
    /// `substring`, advancing the cursor past it on a match.
    ///
    /// The scan and the cursor update happen under one lock acquisition.
    pub fn find_from(&self, from: usize, substring: &str) -> Scan {
        let mut state = self.lock();
        let start = from.max(state.cursor).min(state.lines.len());
        let hit = state.lines[start..]
            .iter()
            .position(|line| line.contains(substring));
        match hit {
            Some(offset) => {
                let index = start + offset;
                state.cursor = index + 1;
                Scan::Matched(state.lines[index].clone())
            }
            None => Scan::Pending {
                scanned_to: state.lines.len(),
                closed: state.closed,
            },
        }
    }

    /// Future that resolves on the next append or close.
    ///
    /// Call [`Notified::enable`] on the pinned future before scanning so a
    /// change that lands during the scan still wakes the caller.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Every line from the start of the log, then new lines as they arrive,
    /// ending when the stream closes. Does not move the cursor.
    pub fn follow(self: Arc<Self>) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        let stream = async_stream::stream! {
            let mut next = 0usize;
            loop {
                let changed = self.changed();
                tokio::pin!(changed);
                changed.as_mut().enable();

                let (batch, closed) = {
                    let state = self.lock();
                    (state.lines[next..].to_vec(), state.closed)
                };
                next += batch.len();
                for line in batch {
                    yield line;
                }
                if closed {
                    break;
                }
                changed.await;
            }
        };
        Box::pin(stream)
    }
}
