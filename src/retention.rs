//! Local retention sweep over the backup directory.

use std::io;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Errors raised while sweeping.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// Raised when a directory or file cannot be inspected or removed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl RetentionError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// What a sweep removed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Files deleted, in visit order.
    pub removed: Vec<Utf8PathBuf>,
    /// Files inspected and kept.
    pub kept: usize,
}

/// Removes files older than the retention window, at any depth.
///
/// Directories are descended into but never removed. A missing root is
/// treated as empty.
#[derive(Clone, Debug)]
pub struct RetentionSweep {
    directory: Utf8PathBuf,
    max_age: Duration,
}

impl RetentionSweep {
    /// Creates a sweep keeping `retention_days` worth of files.
    #[must_use]
    pub fn new(directory: Utf8PathBuf, retention_days: u32) -> Self {
        Self {
            directory,
            max_age: Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY),
        }
    }

    /// Root directory being swept.
    #[must_use]
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// Sweeps relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RetentionError::Io`] when an entry cannot be listed,
    /// inspected or removed.
    pub fn run(&self, now: SystemTime) -> Result<SweepSummary, RetentionError> {
        let mut summary = SweepSummary::default();
        let Some(cutoff) = now.checked_sub(self.max_age) else {
            return Ok(summary);
        };

        let root = match Dir::open_ambient_dir(&self.directory, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.directory, "backup directory missing, nothing to sweep");
                return Ok(summary);
            }
            Err(err) => return Err(RetentionError::io(&self.directory, &err)),
        };

        sweep_dir(&root, &self.directory, cutoff, &mut summary)?;
        info!(
            dir = %self.directory,
            removed = summary.removed.len(),
            kept = summary.kept,
            "retention sweep finished"
        );
        Ok(summary)
    }
}

fn sweep_dir(
    dir: &Dir,
    path: &Utf8Path,
    cutoff: SystemTime,
    summary: &mut SweepSummary,
) -> Result<(), RetentionError> {
    let entries = dir.entries().map_err(|err| RetentionError::io(path, &err))?;
    for item in entries {
        let entry = item.map_err(|err| RetentionError::io(path, &err))?;
        let name = entry
            .file_name()
            .map_err(|err| RetentionError::io(path, &err))?;
        let entry_path = path.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|err| RetentionError::io(&entry_path, &err))?;

        if file_type.is_dir() {
            let child = entry
                .open_dir()
                .map_err(|err| RetentionError::io(&entry_path, &err))?;
            sweep_dir(&child, &entry_path, cutoff, summary)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map_err(|err| RetentionError::io(&entry_path, &err))?
            .into_std();
        if modified < cutoff {
            dir.remove_file(&name)
                .map_err(|err| RetentionError::io(&entry_path, &err))?;
            debug!(file = %entry_path, "removed expired backup");
            summary.removed.push(entry_path);
        } else {
            summary.kept += 1;
        }
    }
    Ok(())
}
