use std::path::Path;

use testforge_core::{Result, RetryPolicy};
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::fs_errors::{is_lock_error, is_not_found};
use crate::probe::LockProbe;

/// What happened to a file passed to [`remove_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The file existed and is gone now
    Removed,
    /// There was nothing to remove
    Missing,
    /// The file stayed locked through every attempt and was left in place
    GaveUp,
}

/// Removes a single file, retrying while it is locked.
///
/// Each attempt probes the file first and only then removes it. Once every
/// attempt has hit a lock the file is left alone and `GaveUp` is returned.
///
/// # Errors
/// Returns errors that are neither "not found" nor lock-class
pub async fn remove_with_retry(
    path: &Path,
    probe: &dyn LockProbe,
    policy: RetryPolicy,
) -> Result<RemovalOutcome> {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let result = match probe.probe(path).await {
            Ok(()) => fs::remove_file(path).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed file");
                return Ok(RemovalOutcome::Removed);
            }
            Err(err) if is_not_found(&err) => return Ok(RemovalOutcome::Missing),
            Err(err) if is_lock_error(&err) => {
                if attempt == attempts {
                    warn!(
                        path = %path.display(),
                        attempts,
                        error = %err,
                        "File still locked, leaving it in place"
                    );
                    return Ok(RemovalOutcome::GaveUp);
                }
                debug!(path = %path.display(), attempt, "File locked, retrying");
                sleep(policy.delay()).await;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(RemovalOutcome::GaveUp)
}

/// Removes a file or a whole directory tree.
///
/// Returns `false` when nothing existed at `path`.
///
/// # Errors
/// Returns any I/O error other than "not found"
pub async fn remove_path(path: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if is_not_found(&err) => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}
