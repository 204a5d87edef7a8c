//! How an agent is told where its config file lives.
//!
//! The harness never interprets the config; it only needs to pass the
//! path on the command line in whatever form the agent expects. A
//! [`LaunchConvention`] turns the user's arguments plus the session paths
//! into the final argument list.

use std::path::{Path, PathBuf};

/// Everything the supervisor needs to spawn the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    /// Final argument list, after the convention has been applied.
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Extra environment variables, merged into the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Strategy for building an agent's argument list.
pub trait LaunchConvention: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn arguments(&self, user_args: &[String], config_path: &Path, work_dir: &Path) -> Vec<String>;
}

// Compile-time assertion: LaunchConvention must be usable as `dyn`.
const _: () = {
    fn _assert_object_safe(_: &dyn LaunchConvention) {}
};

/// Beats-style invocation: `--path.home <work_dir> -c <config> <args...>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BeatConvention;

impl LaunchConvention for BeatConvention {
    fn name(&self) -> &str {
        "beat"
    }

    fn arguments(&self, user_args: &[String], config_path: &Path, work_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--path.home".to_string(),
            work_dir.display().to_string(),
            "-c".to_string(),
            config_path.display().to_string(),
        ];
        args.extend(user_args.iter().cloned());
        args
    }
}

/// Generic invocation: `<args...> <flag> <config>`.
#[derive(Debug, Clone)]
pub struct ConfigFlag {
    flag: String,
}

impl ConfigFlag {
    pub fn new(flag: impl Into<String>) -> Self {
        Self { flag: flag.into() }
    }
}

impl LaunchConvention for ConfigFlag {
    fn name(&self) -> &str {
        &self.flag
    }

    fn arguments(&self, user_args: &[String], config_path: &Path, _work_dir: &Path) -> Vec<String> {
        let mut args = user_args.to_vec();
        args.push(self.flag.clone());
        args.push(config_path.display().to_string());
        args
    }
}
