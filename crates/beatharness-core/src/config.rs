//! Harness settings read from the environment.
//!
//! [`HarnessConfig::from_env`] reads `BEATHARNESS_*` variables over
//! built-in defaults; builder setters override both.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// What to do with a session's temporary directory when the session is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepWorkdir {
    /// Always delete it.
    Never,
    /// Keep it when the session is dropped while the thread is panicking
    /// (i.e. a test assertion failed), so the config and logs can be
    /// inspected.
    #[default]
    OnFailure,
    /// Never delete it.
    Always,
}

impl FromStr for KeepWorkdir {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "false" | "0" => Ok(KeepWorkdir::Never),
            "on-failure" | "on_failure" => Ok(KeepWorkdir::OnFailure),
            "always" | "true" | "1" => Ok(KeepWorkdir::Always),
            other => Err(format!(
                "invalid keep-workdir value {other:?} (expected never, on-failure, or always)"
            )),
        }
    }
}

impl fmt::Display for KeepWorkdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeepWorkdir::Never => "never",
            KeepWorkdir::OnFailure => "on-failure",
            KeepWorkdir::Always => "always",
        })
    }
}

/// Harness tuning knobs.
///
/// Reads from `BEATHARNESS_*` environment variables, falling back to
/// built-in defaults. Builder setters override either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Upper bound on how long a waiter sleeps between scans.
    pub poll_interval: Duration,
    /// How long `stop` waits after SIGTERM before killing, and how long it
    /// then waits for each capture unit to drain.
    pub stop_grace: Duration,
    /// Temporary directory retention policy.
    pub keep_workdir: KeepWorkdir,
    /// Parent directory for session temp dirs. `None` means the system
    /// temp directory.
    pub temp_root: Option<PathBuf>,
    /// Config file name inside the work dir. `None` means `<agent>.yml`.
    pub config_file_name: Option<String>,
}

impl HarnessConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

    pub const ENV_POLL_INTERVAL_MS: &'static str = "BEATHARNESS_POLL_INTERVAL_MS";
    pub const ENV_STOP_GRACE_MS: &'static str = "BEATHARNESS_STOP_GRACE_MS";
    pub const ENV_KEEP_WORKDIR: &'static str = "BEATHARNESS_KEEP_WORKDIR";
    pub const ENV_TEMP_ROOT: &'static str = "BEATHARNESS_TEMP_ROOT";

    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, Self::ENV_POLL_INTERVAL_MS) {
            if ms == 0 {
                warn!(var = Self::ENV_POLL_INTERVAL_MS, "poll interval must be positive, using default");
            } else {
                config.poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, Self::ENV_STOP_GRACE_MS) {
            config.stop_grace = Duration::from_millis(ms);
        }
        if let Some(keep) = parse_var::<KeepWorkdir>(&lookup, Self::ENV_KEEP_WORKDIR) {
            config.keep_workdir = keep;
        }
        if let Some(root) = lookup(Self::ENV_TEMP_ROOT).filter(|s| !s.trim().is_empty()) {
            config.temp_root = Some(PathBuf::from(root));
        }

        config
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn keep_workdir(mut self, keep: KeepWorkdir) -> Self {
        self.keep_workdir = keep;
        self
    }

    pub fn temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn config_file_name(mut self, name: impl Into<String>) -> Self {
        self.config_file_name = Some(name.into());
        self
    }

    /// The config file name to use for an agent called `agent`.
    pub fn resolve_config_file_name(&self, agent: &str) -> String {
        self.config_file_name
            .clone()
            .unwrap_or_else(|| format!("{agent}.yml"))
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            stop_grace: Self::DEFAULT_STOP_GRACE,
            keep_workdir: KeepWorkdir::default(),
            temp_root: None,
            config_file_name: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = key, value = %raw, error = %e, "ignoring invalid harness setting");
            None
        }
    }
}
