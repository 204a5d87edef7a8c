//! Spawning, observing and terminating the agent process.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::spawn_capture;
use crate::error::HarnessError;
use crate::launch::LaunchSpec;
use crate::session::SessionState;
use crate::stream::StreamLog;

/// Owns one child process and the two capture tasks reading its output.
///
/// Dropping a supervisor whose process is still alive kills and reaps the
/// process and shuts capture down; call [`ProcessSupervisor::stop`] for an
/// orderly SIGTERM-then-SIGKILL shutdown that also drains captured output.
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Option<Child>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    captures: Vec<JoinHandle<()>>,
    logs: Vec<Arc<StreamLog>>,
    grace: Duration,
}

/// How often [`ProcessSupervisor::kill_now`] polls for the killed process.
const REAP_POLL: Duration = Duration::from_millis(5);

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            child: None,
            pid: None,
            exit_status: None,
            captures: Vec::new(),
            logs: Vec::new(),
            grace,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the process and attach both capture units.
    ///
    /// Must be called from within a Tokio runtime. Capture tasks are
    /// running before this returns, so no output can be missed.
    pub fn start(
        &mut self,
        launch: &LaunchSpec,
        stdout_log: Arc<StreamLog>,
        stderr_log: Arc<StreamLog>,
    ) -> Result<u32, HarnessError> {
        if self.child.is_some() || self.exit_status.is_some() {
            return Err(HarnessError::InvalidState {
                operation: "start",
                state: SessionState::Started,
            });
        }

        let mut cmd = Command::new(&launch.executable);
        cmd.args(&launch.args)
            .current_dir(&launch.work_dir)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            executable: launch.executable.clone(),
            source,
        })?;

        // A pid is only missing once the child has been reaped, which cannot
        // have happened yet.
        let pid = child.id().unwrap_or_default();

        self.logs = vec![Arc::clone(&stdout_log), Arc::clone(&stderr_log)];
        match child.stdout.take() {
            Some(stdout) => self.captures.push(spawn_capture(stdout, stdout_log)),
            None => stdout_log.close(),
        }
        match child.stderr.take() {
            Some(stderr) => self.captures.push(spawn_capture(stderr, stderr_log)),
            None => stderr_log.close(),
        }

        info!(
            pid,
            executable = %launch.executable.display(),
            args = ?launch.args,
            work_dir = %launch.work_dir.display(),
            "started process"
        );

        self.pid = Some(pid);
        self.child = Some(child);
        Ok(pid)
    }

    /// Whether the process has been started and has not exited yet.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "error checking process status");
                false
            }
        }
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Wait up to `timeout` for the process to exit on its own.
    ///
    /// Does not signal the process; on timeout it keeps running.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Result<ExitStatus, HarnessError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let Some(child) = self.child.as_mut() else {
            return Err(HarnessError::InvalidState {
                operation: "wait for exit of",
                state: SessionState::Created,
            });
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, %status, "process exited");
                self.exit_status = Some(status);
                Ok(status)
            }
            Ok(Err(e)) => Err(HarnessError::Stop(e)),
            Err(_) => Err(HarnessError::ExitTimeout { timeout }),
        }
    }

    /// Terminate the process (if still alive) and drain capture.
    ///
    /// Sends SIGTERM, waits up to the grace period, then SIGKILLs. Each
    /// capture task then gets the same grace period to reach end-of-stream
    /// before it is aborted. Both logs are closed on return. Safe to call
    /// repeatedly and after a natural exit.
    ///
    /// The child handle is released only once the process is reaped, so a
    /// failed or cancelled `stop` leaves it for the next `stop` or for
    /// `Drop`.
    pub async fn stop(&mut self) -> Result<Option<ExitStatus>, HarnessError> {
        if let Some(child) = self.child.as_mut() {
            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                _ => terminate(child, self.pid, self.grace).await?,
            };
            info!(pid = ?self.pid, %status, "process stopped");
            self.exit_status = Some(status);
            self.child = None;
        }

        for mut handle in self.captures.drain(..) {
            if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                // Something else (e.g. a grandchild) still holds the pipe open.
                warn!(pid = ?self.pid, "capture did not reach end of stream, aborting");
                handle.abort();
            }
        }
        self.close_logs();

        Ok(self.exit_status)
    }

    /// SIGKILL a live process and reap it without awaiting, then shut
    /// capture down and close both logs.
    ///
    /// Blocks the calling thread until the process is reaped, for at most
    /// the grace period. Used on drop, where nothing can be awaited.
    pub fn kill_now(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => self.exit_status = Some(status),
                _ => {
                    warn!(pid = ?self.pid, "killing live process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid = ?self.pid, error = %e, "failed to send SIGKILL");
                    }
                    let deadline = Instant::now() + self.grace;
                    loop {
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                self.exit_status = Some(status);
                                break;
                            }
                            Ok(None) if Instant::now() < deadline => std::thread::sleep(REAP_POLL),
                            Ok(None) => {
                                warn!(pid = ?self.pid, "process not reaped after SIGKILL");
                                break;
                            }
                            Err(e) => {
                                warn!(pid = ?self.pid, error = %e, "error reaping killed process");
                                break;
                            }
                        }
                    }
                }
            }
            if self.exit_status.is_some() {
                self.child = None;
            }
        }

        for handle in self.captures.drain(..) {
            handle.abort();
        }
        self.close_logs();
    }

    // Aborted capture tasks never observe end-of-stream themselves.
    fn close_logs(&self) {
        for log in &self.logs {
            log.close();
        }
    }
}

async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<ExitStatus, HarnessError> {
    #[cfg(unix)]
    if let Some(raw) = child.id().and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: `raw` is the pid of a child we spawned and have not reaped.
        let ret = unsafe { libc::kill(raw, libc::SIGTERM) };
        if ret != 0 {
            warn!(?pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?pid, "process exited after SIGTERM");
            Ok(status)
        }
        _ => {
            debug!(?pid, "process did not exit after SIGTERM, sending SIGKILL");
            child.kill().await.map_err(HarnessError::Stop)?;
            child.wait().await.map_err(HarnessError::Stop)
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill_now();
    }
}
