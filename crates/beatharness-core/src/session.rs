//! One test's agent process, config file and captured output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, TokioClock};
use crate::config::{HarnessConfig, KeepWorkdir};
use crate::error::HarnessError;
use crate::launch::{BeatConvention, LaunchConvention, LaunchSpec};
use crate::materialize::write_config;
use crate::stream::{StreamKind, StreamLog};
use crate::supervisor::ProcessSupervisor;
use crate::waiter::PatternWaiter;

/// Lifecycle of a [`HarnessSession`]. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Created,
    ConfigWritten,
    /// Spawning the agent failed. Terminal: the session cannot be started.
    SpawnFailed,
    Started,
    Exited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Created => "created",
            SessionState::ConfigWritten => "config-written",
            SessionState::SpawnFailed => "spawn-failed",
            SessionState::Started => "started",
            SessionState::Exited => "exited",
        })
    }
}

/// An agent process under test, with its own temporary working directory.
///
/// The session is the single owner of the directory, the process and the
/// two output logs. Dropping it kills a still-running process; the
/// directory is removed unless [`HarnessConfig::keep_workdir`] says
/// otherwise.
pub struct HarnessSession {
    id: Uuid,
    name: String,
    executable: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    config: HarnessConfig,
    convention: Box<dyn LaunchConvention>,
    /// `Option` so `Drop` can decide to keep it.
    work_dir: Option<TempDir>,
    work_path: PathBuf,
    config_path: Option<PathBuf>,
    supervisor: ProcessSupervisor,
    stdout: Arc<StreamLog>,
    stderr: Arc<StreamLog>,
    waiter: PatternWaiter,
    state: SessionState,
}

impl fmt::Debug for HarnessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("work_dir", &self.work_path)
            .field("state", &self.state)
            .field("pid", &self.supervisor.pid())
            .finish()
    }
}

impl HarnessSession {
    /// Create a session using [`HarnessConfig::from_env`].
    ///
    /// `name` is the agent name; it prefixes the temp directory and names
    /// the default config file (`<name>.yml`).
    pub fn new<I, S>(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        args: I,
    ) -> Result<Self, HarnessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(name, executable, args, HarnessConfig::from_env())
    }

    /// Create a session with an explicit config.
    pub fn with_config<I, S>(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        args: I,
        config: HarnessConfig,
    ) -> Result<Self, HarnessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let mut builder = tempfile::Builder::new();
        let prefix = format!("{name}-");
        builder.prefix(&prefix);
        let work_dir = match &config.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(HarnessError::WorkDir)?;
        let work_path = std::path::absolute(work_dir.path()).map_err(HarnessError::WorkDir)?;

        let id = Uuid::new_v4();
        info!(session_id = %id, agent = %name, work_dir = %work_path.display(), "created harness session");

        Ok(Self {
            id,
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            supervisor: ProcessSupervisor::new(config.stop_grace),
            waiter: PatternWaiter::new(Arc::new(TokioClock), config.poll_interval),
            convention: Box::new(BeatConvention),
            work_dir: Some(work_dir),
            work_path,
            config_path: None,
            stdout: Arc::new(StreamLog::new(StreamKind::Stdout)),
            stderr: Arc::new(StreamLog::new(StreamKind::Stderr)),
            state: SessionState::Created,
            name,
            config,
        })
    }

    /// Use a different argument convention (default: [`BeatConvention`]).
    pub fn convention(mut self, convention: impl LaunchConvention + 'static) -> Self {
        self.convention = Box::new(convention);
        self
    }

    /// Use a different clock for waits (default: [`TokioClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.waiter = PatternWaiter::new(clock, self.config.poll_interval);
        self
    }

    /// Add an environment variable for the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_path
    }

    /// Path of the materialized config file, once written.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Current state; notices a process that has exited on its own.
    pub fn state(&mut self) -> SessionState {
        if self.state == SessionState::Started && !self.supervisor.is_running() {
            self.state = SessionState::Exited;
        }
        self.state
    }

    /// Write the agent config into the session directory.
    ///
    /// Allowed exactly once, before [`HarnessSession::start`].
    pub fn write_config_file(&mut self, contents: &str) -> Result<&Path, HarnessError> {
        if self.state != SessionState::Created {
            return Err(HarnessError::InvalidState {
                operation: "write config for",
                state: self.state,
            });
        }
        let file_name = self.config.resolve_config_file_name(&self.name);
        let path = write_config(&self.work_path, &file_name, contents)?;
        info!(session_id = %self.id, path = %path.display(), "materialized config");
        self.state = SessionState::ConfigWritten;
        Ok(self.config_path.insert(path).as_path())
    }

    /// The final argument list the agent will be started with.
    pub fn resolved_args(&self) -> Option<Vec<String>> {
        let config_path = self.config_path.as_deref()?;
        Some(
            self.convention
                .arguments(&self.args, config_path, &self.work_path),
        )
    }

    /// Spawn the agent and start capturing both streams.
    ///
    /// Requires a written config; callable once, and a spawn failure is not
    /// retried. Must run inside a Tokio
    /// runtime.
    pub fn start(&mut self) -> Result<u32, HarnessError> {
        if self.state != SessionState::ConfigWritten {
            return Err(HarnessError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let args = self.resolved_args().unwrap_or_default();
        let launch = LaunchSpec {
            executable: self.executable.clone(),
            args,
            work_dir: self.work_path.clone(),
            env: self.env.clone(),
        };
        let pid = match self.supervisor.start(
            &launch,
            Arc::clone(&self.stdout),
            Arc::clone(&self.stderr),
        ) {
            Ok(pid) => pid,
            Err(e) => {
                self.state = SessionState::SpawnFailed;
                return Err(e);
            }
        };
        info!(
            session_id = %self.id,
            pid,
            convention = self.convention.name(),
            "agent started"
        );
        self.state = SessionState::Started;
        Ok(pid)
    }

    pub fn log(&self, stream: StreamKind) -> &Arc<StreamLog> {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Wait until a line at or after `stream`'s cursor contains
    /// `substring`, returning that line and moving the cursor past it.
    ///
    /// Fails with [`HarnessError::Timeout`] after `timeout`, or earlier with
    /// [`HarnessError::StreamClosed`] if the process exits first.
    pub async fn wait_for_contains(
        &self,
        stream: StreamKind,
        substring: &str,
        timeout: Duration,
    ) -> Result<String, HarnessError> {
        if self.state < SessionState::Started {
            return Err(HarnessError::InvalidState {
                operation: "wait on",
                state: self.state,
            });
        }
        let result = self
            .waiter
            .wait_for_contains(self.log(stream), substring, timeout)
            .await;
        if let Err(e) = &result {
            warn!(session_id = %self.id, %stream, substring, error = %first_line(e), "wait failed");
        }
        result
    }

    pub async fn wait_stdout_contains(
        &self,
        substring: &str,
        timeout: Duration,
    ) -> Result<String, HarnessError> {
        self.wait_for_contains(StreamKind::Stdout, substring, timeout)
            .await
    }

    pub async fn wait_stderr_contains(
        &self,
        substring: &str,
        timeout: Duration,
    ) -> Result<String, HarnessError> {
        self.wait_for_contains(StreamKind::Stderr, substring, timeout)
            .await
    }

    /// Whether any line captured so far on `stream` contains `substring`.
    /// Ignores and does not move the cursor.
    pub fn log_contains(&self, stream: StreamKind, substring: &str) -> bool {
        self.log(stream).contains(substring)
    }

    /// Snapshot of every line captured on `stream` so far.
    pub fn captured(&self, stream: StreamKind) -> Vec<String> {
        self.log(stream).lines()
    }

    /// All lines of `stream`, past and future, until it closes.
    pub fn follow(&self, stream: StreamKind) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        Arc::clone(self.log(stream)).follow()
    }

    pub fn is_running(&mut self) -> bool {
        self.state() == SessionState::Started
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.supervisor.exit_status()
    }

    /// Wait for the agent to exit on its own, without signalling it.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Result<ExitStatus, HarnessError> {
        let status = self.supervisor.wait_for_exit(timeout).await?;
        self.state = SessionState::Exited;
        Ok(status)
    }

    /// Terminate the agent and drain capture. Idempotent.
    pub async fn stop(&mut self) -> Result<Option<ExitStatus>, HarnessError> {
        let status = self.supervisor.stop().await?;
        if self.state >= SessionState::Started {
            self.state = SessionState::Exited;
        }
        Ok(status)
    }
}

fn first_line(err: &HarnessError) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}

impl Drop for HarnessSession {
    fn drop(&mut self) {
        // Fields drop after this body, so the agent has to be dead before
        // its home directory is removed.
        self.supervisor.kill_now();
        self.stdout.close();
        self.stderr.close();

        let Some(dir) = self.work_dir.take() else {
            return;
        };
        let keep = match self.config.keep_workdir {
            KeepWorkdir::Never => false,
            KeepWorkdir::Always => true,
            KeepWorkdir::OnFailure => std::thread::panicking(),
        };
        if keep {
            let path = dir.keep();
            info!(session_id = %self.id, work_dir = %path.display(), "keeping session directory");
        } else if let Err(e) = dir.close() {
            warn!(session_id = %self.id, error = %e, "failed to remove session directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Path) -> HarnessConfig {
        HarnessConfig::default()
            .temp_root(root)
            .keep_workdir(KeepWorkdir::Never)
    }

    #[test]
    fn state_ordering_and_display() {
        assert!(SessionState::Created < SessionState::ConfigWritten);
        assert!(SessionState::ConfigWritten < SessionState::Started);
        assert!(SessionState::SpawnFailed < SessionState::Started);
        assert!(SessionState::Started < SessionState::Exited);
        assert_eq!(SessionState::ConfigWritten.to_string(), "config-written");
        assert_eq!(SessionState::SpawnFailed.to_string(), "spawn-failed");
    }

    #[test]
    fn new_session_has_private_work_dir() {
        let root = tempfile::tempdir().unwrap();
        let mut a = HarnessSession::with_config("mockbeat", "true", ["-e"], config_in(root.path()))
            .unwrap();
        let b = HarnessSession::with_config("mockbeat", "true", ["-e"], config_in(root.path()))
            .unwrap();

        assert_ne!(a.work_dir(), b.work_dir());
        assert!(a.work_dir().is_absolute());
        assert!(a.work_dir().starts_with(root.path()));
        assert!(
            a.work_dir()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("mockbeat-")
        );
        assert_eq!(a.state(), SessionState::Created);
        assert!(a.config_path().is_none());
        assert!(a.resolved_args().is_none());
    }

    #[test]
    fn write_config_then_resolved_args_follow_beat_convention() {
        let root = tempfile::tempdir().unwrap();
        let mut s = HarnessSession::with_config("mockbeat", "true", ["-e"], config_in(root.path()))
            .unwrap();

        let path = s.write_config_file("name: test\n").unwrap().to_path_buf();
        assert_eq!(path, s.work_dir().join("mockbeat.yml"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: test\n");
        assert_eq!(s.state(), SessionState::ConfigWritten);

        let work = s.work_dir().display().to_string();
        let cfg = path.display().to_string();
        assert_eq!(
            s.resolved_args().unwrap(),
            vec!["--path.home".to_string(), work, "-c".to_string(), cfg, "-e".to_string()]
        );
    }

    #[test]
    fn config_can_only_be_written_once() {
        let root = tempfile::tempdir().unwrap();
        let mut s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), config_in(root.path()))
            .unwrap();
        s.write_config_file("a: 1\n").unwrap();
        let err = s.write_config_file("a: 2\n").unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidState {
                state: SessionState::ConfigWritten,
                ..
            }
        ));
        assert_eq!(
            std::fs::read_to_string(s.config_path().unwrap()).unwrap(),
            "a: 1\n"
        );
    }

    #[test]
    fn start_requires_config() {
        let root = tempfile::tempdir().unwrap();
        let mut s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), config_in(root.path()))
            .unwrap();
        let err = s.start().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidState {
                operation: "start",
                state: SessionState::Created
            }
        ));
        assert!(s.pid().is_none());
    }

    #[tokio::test]
    async fn wait_before_start_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), config_in(root.path()))
            .unwrap();
        let err = s
            .wait_stdout_contains("anything", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[test]
    fn drop_removes_work_dir_when_never_kept() {
        let root = tempfile::tempdir().unwrap();
        let s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), config_in(root.path()))
            .unwrap();
        let dir = s.work_dir().to_path_buf();
        assert!(dir.exists());
        drop(s);
        assert!(!dir.exists());
    }

    #[test]
    fn drop_keeps_work_dir_when_always() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config_in(root.path()).keep_workdir(KeepWorkdir::Always);
        let s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), cfg).unwrap();
        let dir = s.work_dir().to_path_buf();
        drop(s);
        assert!(dir.exists());
    }

    #[test]
    fn on_failure_removes_dir_when_not_panicking() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config_in(root.path()).keep_workdir(KeepWorkdir::OnFailure);
        let s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), cfg).unwrap();
        let dir = s.work_dir().to_path_buf();
        drop(s);
        assert!(!dir.exists());
    }

    #[test]
    fn on_failure_keeps_dir_when_panicking() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config_in(root.path()).keep_workdir(KeepWorkdir::OnFailure);
        let s = HarnessSession::with_config("mockbeat", "true", Vec::<String>::new(), cfg).unwrap();
        let dir = s.work_dir().to_path_buf();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _session = s;
            panic!("simulated assertion failure");
        }));
        assert!(result.is_err());
        assert!(dir.exists());
    }
}
