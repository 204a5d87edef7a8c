//! Shared test utilities for beatharness integration tests.
//!
//! Provides throwaway `/bin/sh` scripts that stand in for an agent, and a
//! tracing subscriber that routes harness logs through the test writer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Write an executable `#!/bin/sh` script at `dir/name` and return its path.
///
/// `body` is everything after the shebang line. The write handle is synced
/// and closed before the file is made executable, so the script can be
/// exec'd as soon as this returns.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap_or_else(|e| panic!("failed to create script {}: {e}", path.display()));
    file.write_all(format!("#!/bin/sh\n{body}").as_bytes())
        .and_then(|()| file.sync_all())
        .unwrap_or_else(|e| panic!("failed to write script {}: {e}", path.display()));
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|e| panic!("failed to chmod script {}: {e}", path.display()));
    }

    path
}

/// Poll `/proc/<pid>/stat` until the process is gone or a zombie, for up to
/// `within`. Returns whether it got there.
#[cfg(target_os = "linux")]
pub fn process_exited(pid: u32, within: std::time::Duration) -> bool {
    use std::time::{Duration, Instant};

    let stat = format!("/proc/{pid}/stat");
    let deadline = Instant::now() + within;
    loop {
        let dead = match std::fs::read_to_string(&stat) {
            Err(_) => true,
            Ok(contents) => {
                let state = contents
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.split_whitespace().next());
                matches!(state, Some("Z") | Some("X"))
            }
        };
        if dead || Instant::now() >= deadline {
            return dead;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// A fresh temp dir holding a single fake agent script.
///
/// Keep the returned [`TempDir`] alive for as long as the script is used.
pub fn fake_agent(body: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create fake agent dir");
    let path = write_script(dir.path(), "fake-agent.sh", body);
    (dir, path)
}

/// Install a `fmt` subscriber that writes through the test harness's
/// captured output. Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_written_with_shebang() {
        let (_dir, path) = fake_agent("echo hi\n");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "#!/bin/sh\necho hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, path) = fake_agent("true\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[cfg(unix)]
    #[test]
    fn script_runs_immediately_after_write() {
        let (dir, _) = fake_agent("true\n");
        for i in 0..20 {
            let path = write_script(dir.path(), &format!("run-{i}.sh"), "echo ran\n");
            let out = std::process::Command::new(&path).output().unwrap();
            assert!(out.status.success());
            assert_eq!(out.stdout, b"ran\n");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_exited_sees_reaped_child() {
        use std::time::Duration;
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(process_exited(pid, Duration::from_secs(1)));
        assert!(!process_exited(std::process::id(), Duration::ZERO));
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
