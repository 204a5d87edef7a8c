//! Deadline-bounded substring search over a [`StreamLog`].

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{CapturedLines, HarnessError};
use crate::stream::{Scan, StreamLog};

/// Blocks the calling task until a captured line contains a substring.
///
/// Between scans the waiter sleeps until either the log changes or one
/// `poll_interval` elapses, whichever is first. Each pass only looks at
/// lines appended since the previous pass.
#[derive(Clone)]
pub struct PatternWaiter {
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl std::fmt::Debug for PatternWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternWaiter")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl PatternWaiter {
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            clock,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait for the next line at or after the log's cursor that contains
    /// `substring`, and return it.
    ///
    /// A zero `timeout` performs exactly one scan. If the stream is closed
    /// and nothing matched, this fails with [`HarnessError::StreamClosed`]
    /// right away instead of waiting for the deadline.
    pub async fn wait_for_contains(
        &self,
        log: &StreamLog,
        substring: &str,
        timeout: Duration,
    ) -> Result<String, HarnessError> {
        let started = self.clock.now();
        let mut scanned = 0usize;

        loop {
            let changed = log.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match log.find_from(scanned, substring) {
                Scan::Matched(line) => {
                    debug!(stream = %log.kind(), substring, cursor = log.cursor(), "pattern matched");
                    return Ok(line);
                }
                Scan::Pending { scanned_to, closed } => {
                    scanned = scanned_to;
                    if closed {
                        return Err(HarnessError::StreamClosed {
                            stream: log.kind(),
                            substring: substring.to_string(),
                            elapsed: self.elapsed_since(started),
                            timeout,
                            captured: snapshot(log),
                        });
                    }
                }
            }

            let elapsed = self.elapsed_since(started);
            if elapsed >= timeout {
                return Err(HarnessError::Timeout {
                    stream: log.kind(),
                    substring: substring.to_string(),
                    timeout,
                    captured: snapshot(log),
                });
            }

            let pause = self.poll_interval.min(timeout - elapsed);
            tokio::select! {
                _ = &mut changed => {}
                _ = self.clock.sleep(pause) => {}
            }
        }
    }

    fn elapsed_since(&self, started: std::time::Instant) -> Duration {
        self.clock.now().saturating_duration_since(started)
    }
}

fn snapshot(log: &StreamLog) -> CapturedLines {
    CapturedLines {
        stream: log.kind(),
        lines: log.lines(),
    }
}
