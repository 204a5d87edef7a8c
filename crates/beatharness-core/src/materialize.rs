//! Writing the agent's config file into the session directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::HarnessError;

/// Write `contents` verbatim to `dir/file_name` and return the full path.
///
/// The file is created (or truncated) with mode `0600` on Unix, since beats
/// refuse config files that other users can write. The data is flushed to
/// disk before returning, so a process started afterwards sees all of it.
pub fn write_config(dir: &Path, file_name: &str, contents: &str) -> Result<PathBuf, HarnessError> {
    let path = dir.join(file_name);
    let wrap = |source| HarnessError::ConfigWrite {
        path: path.clone(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path).map_err(wrap)?;
    file.write_all(contents.as_bytes()).map_err(wrap)?;
    file.sync_all().map_err(wrap)?;

    debug!(path = %path.display(), bytes = contents.len(), "wrote config file");
    Ok(path)
}
