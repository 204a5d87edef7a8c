mod ecs;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ecs::EcsFormat;

const BEAT_NAME: &str = "mockbeat";
const ALIVE_MESSAGE: &str = "Mockbeat is alive!";

/// Minimal beat used to exercise the process test harness.
///
/// Publishes one event per period to stdout (console output) and writes
/// ECS JSON logs either to `<path.home>/logs/mockbeat.ndjson` or, with
/// `-e`, to stderr.
#[derive(Parser, Debug)]
#[command(name = "mockbeat", about = "Mock beat for harness tests")]
struct Cli {
    /// Configuration file (relative paths resolve against --path.home)
    #[arg(short = 'c', long = "config", default_value = "mockbeat.yml")]
    config: PathBuf,

    /// Home directory for config and logs (defaults to the current directory)
    #[arg(long = "path.home")]
    path_home: Option<PathBuf>,

    /// Log to stderr and disable file logging
    #[arg(short = 'e')]
    log_to_stderr: bool,

    /// Milliseconds between published events
    #[arg(long, default_value_t = 1000)]
    period_ms: u64,

    /// Exit after publishing this many events
    #[arg(long)]
    max_events: Option<u64>,

    /// Echo the raw config file to stdout before starting
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    beat: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    version: &'a str,
}

/// One published event, as the console output would render it.
#[derive(Debug, Serialize)]
struct MockEvent<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(rename = "@metadata")]
    metadata: Metadata<'a>,
    #[serde(rename = "type")]
    kind: &'a str,
    counter: u64,
    message: &'a str,
}

impl MockEvent<'_> {
    fn new(counter: u64) -> Self {
        MockEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata: Metadata {
                beat: BEAT_NAME,
                kind: "_doc",
                version: env!("CARGO_PKG_VERSION"),
            },
            kind: "mock",
            counter,
            message: ALIVE_MESSAGE,
        }
    }
}

fn resolve(home: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

/// Install the ECS subscriber. Filter comes from `MOCKBEAT_LOG`, default
/// `info`.
fn init_logging(to_stderr: bool, home: &Path) -> Result<()> {
    let filter =
        EnvFilter::try_from_env("MOCKBEAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(EcsFormat::new(BEAT_NAME));

    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        let dir = home.join("logs");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let path = dir.join(format!("{BEAT_NAME}.ndjson"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.with_writer(Mutex::new(file)).init();
    }
    Ok(())
}

fn publish(event: &MockEvent<'_>) -> Result<()> {
    let line = serde_json::to_string(event).context("failed to encode event")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").context("failed to write event to stdout")?;
    stdout.flush().context("failed to flush stdout")?;
    Ok(())
}

/// Future that resolves on SIGTERM or Ctrl-C.
///
/// The SIGTERM handler is registered before this returns, so a signal sent
/// any time afterwards is not lost to the default action.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Publish events until shutdown or `max_events`. Returns the count.
async fn run(home: &Path, period: Duration, max_events: Option<u64>) -> Result<u64> {
    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(period);
    let mut published = 0u64;

    info!(home = %home.display(), "mockbeat start running.");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                published += 1;
                publish(&MockEvent::new(published))?;
                if max_events.is_some_and(|max| published >= max) {
                    break;
                }
            }
        }
    }
    Ok(published)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = match &cli.path_home {
        Some(home) => home.clone(),
        None => std::env::current_dir().context("failed to determine current directory")?,
    };
    init_logging(cli.log_to_stderr, &home)?;

    let config_path = resolve(&home, &cli.config);
    let config = match std::fs::read_to_string(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load config");
            return Err(e)
                .with_context(|| format!("failed to read config file {}", config_path.display()));
        }
    };
    info!(path = %config_path.display(), bytes = config.len(), "loaded config");

    if cli.print_config {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(config.as_bytes())?;
        stdout.flush()?;
    }

    let period = Duration::from_millis(cli.period_ms.max(1));
    let published = run(&home, period, cli.max_events).await?;
    info!(published, "mockbeat stopped.");
    Ok(())
}
