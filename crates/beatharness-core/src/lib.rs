//! Process test harness for long-running agents.
//!
//! A [`HarnessSession`] owns one agent process for the duration of a test:
//! it writes the agent's config file into a private temp directory, spawns
//! the agent, captures both output streams in the background, and lets the
//! test wait (with a deadline) for a substring to show up on either stream.
//!
//! # Architecture
//!
//! ```text
//! HarnessSession
//!     |
//!     |-- write_config_file(text) --> materialize::write_config --> <workdir>/<agent>.yml
//!     |
//!     |-- start() --> ProcessSupervisor::start
//!     |                   |-- spawn_capture(stdout) --> StreamLog (stdout)
//!     |                   `-- spawn_capture(stderr) --> StreamLog (stderr)
//!     |
//!     |-- wait_stderr_contains(..) --> PatternWaiter --> StreamLog::find_from
//!     |
//!     `-- stop() / Drop --> SIGTERM, grace period, SIGKILL, drain capture
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut beat = HarnessSession::new("mockbeat", "/path/to/mockbeat", ["-e"])?;
//! beat.write_config_file("output.console:\n  codec.json:\n    pretty: false\n")?;
//! beat.start()?;
//! let line = beat
//!     .wait_stderr_contains("ecs.version", Duration::from_secs(60))
//!     .await?;
//! beat.stop().await?;
//! ```

pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod launch;
pub mod materialize;
pub mod record;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod waiter;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{HarnessConfig, KeepWorkdir};
pub use error::{CapturedLines, HarnessError};
pub use launch::{BeatConvention, ConfigFlag, LaunchConvention, LaunchSpec};
pub use session::{HarnessSession, SessionState};
pub use stream::{StreamKind, StreamLog};
pub use supervisor::ProcessSupervisor;
pub use waiter::PatternWaiter;
