//! Background capture of one output stream into a [`StreamLog`].

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::HarnessError;
use crate::stream::StreamLog;

/// Spawn a task that copies `reader` line by line into `log`.
///
/// The task runs until end-of-stream, then closes the log. A read error
/// other than EOF is logged and marks the log failed instead; it is never
/// returned to the caller, and the log stays open until the supervisor
/// shuts capture down.
pub fn spawn_capture<R>(reader: R, log: Arc<StreamLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let stream = log.kind();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    trace!(%stream, line = %line, "captured line");
                    log.push(line);
                }
                Err(source) => {
                    // Bytes read before the error are still output.
                    if !buf.is_empty() {
                        log.push(decode_line(&buf));
                    }
                    let err = HarnessError::Read { stream, source };
                    warn!(error = ?err, "capture stopped on read error");
                    log.mark_failed();
                    return;
                }
            }
        }

        log.close();
        debug!(%stream, lines = log.len(), "capture reached end of stream");
    })
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stream::StreamKind;
    use crate::waiter::PatternWaiter;
    use std::io;
    use std::time::Duration;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    #[test]
    fn decode_line_strips_terminators() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_line_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn captures_lines_in_order_and_closes_on_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let log = Arc::new(StreamLog::new(StreamKind::Stdout));
        let handle = spawn_capture(rx, Arc::clone(&log));

        tx.write_all(b"one\ntwo\r\nthree").await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(log.lines(), vec!["one", "two", "three"]);
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn lines_are_visible_before_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let log = Arc::new(StreamLog::new(StreamKind::Stderr));
        let _handle = spawn_capture(rx, Arc::clone(&log));

        tx.write_all(b"early\n").await.unwrap();
        for _ in 0..100 {
            if log.len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(log.lines(), vec!["early"]);
        assert!(!log.is_closed());
    }

    /// Reader that yields `payload` once and then fails.
    struct FailingReader {
        payload: Option<&'static [u8]>,
    }

    impl FailingReader {
        fn new(payload: &'static [u8]) -> Self {
            Self {
                payload: Some(payload),
            }
        }
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.payload.take() {
                Some(payload) => {
                    buf.put_slice(payload);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::other("pipe exploded"))),
            }
        }
    }

    #[tokio::test]
    async fn read_error_marks_log_failed_without_closing() {
        let log = Arc::new(StreamLog::new(StreamKind::Stdout));
        let handle = spawn_capture(FailingReader::new(b"before failure\n"), Arc::clone(&log));

        handle.await.expect("capture task must not panic");
        assert_eq!(log.lines(), vec!["before failure"]);
        assert!(log.is_failed());
        assert!(!log.is_closed());
    }

    #[tokio::test]
    async fn partial_line_before_read_error_is_kept() {
        let log = Arc::new(StreamLog::new(StreamKind::Stderr));
        let handle = spawn_capture(FailingReader::new(b"done\nhalf a li"), Arc::clone(&log));

        handle.await.unwrap();
        assert_eq!(log.lines(), vec!["done", "half a li"]);
    }

    #[tokio::test]
    async fn waiter_runs_to_deadline_after_read_error() {
        let log = Arc::new(StreamLog::new(StreamKind::Stdout));
        spawn_capture(FailingReader::new(b"before failure\n"), Arc::clone(&log))
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new());
        let waiter = PatternWaiter::new(clock.clone(), Duration::from_millis(100));
        let err = waiter
            .wait_for_contains(&log, "ecs.version", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Timeout { .. }), "got {err:?}");
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }
}
