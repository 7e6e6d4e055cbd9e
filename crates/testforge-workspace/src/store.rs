use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use testforge_core::{Error, Result, RetryPolicy};
use tokio::fs;
use tokio::task::spawn_blocking;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fs_errors::{is_lock_error, is_not_found};
use crate::probe::{LockProbe, OpenProbe};

/// Rejects names that could escape the workspaces root, hide the directory,
/// or break the files the name is rendered into.
///
/// # Errors
/// Returns `ValidationFailed` describing the problem
pub fn validate_workspace_name(name: &str) -> Result<()> {
    let problem = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.contains("..") {
        Some("must not contain '..'")
    } else if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        Some("may only contain ASCII letters, digits, '-', '_' and '.'")
    } else if Path::new(name)
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        Some("must be a plain directory name")
    } else {
        None
    };

    match problem {
        Some(reason) => Err(Error::ValidationFailed(format!(
            "workspace name '{name}' {reason}"
        ))),
        None => Ok(()),
    }
}

/// Maps project names to directories under a root and deletes them with lock
/// awareness.
#[derive(Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
    policy: RetryPolicy,
    probe: Arc<dyn LockProbe>,
}

impl WorkspaceStore {
    /// Creates a store using the read-write open probe.
    pub fn new(root: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self::with_probe(root, policy, Arc::new(OpenProbe))
    }

    /// Creates a store with a custom lock probe.
    pub fn with_probe(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        probe: Arc<dyn LockProbe>,
    ) -> Self {
        Self {
            root: root.into(),
            policy,
            probe,
        }
    }

    /// Root directory holding every workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `name`, without touching the disk.
    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Creates the workspace directory and returns its absolute path.
    ///
    /// # Errors
    /// Returns `ValidationFailed` for bad names, `AlreadyExists` if the
    /// directory is present, or the I/O error from creating it
    pub async fn create_workspace(&self, name: &str) -> Result<PathBuf> {
        validate_workspace_name(name)?;
        let path = self.workspace_path(name);

        if fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists(name.to_owned()));
        }

        fs::create_dir_all(&path).await?;
        let absolute = fs::canonicalize(&path).await?;
        info!(workspace = name, path = %absolute.display(), "Created workspace");
        Ok(absolute)
    }

    /// Deletes the workspace directory.
    ///
    /// Files that cannot be opened read-write are rescanned up to the policy's
    /// attempt count. A missing directory is a successful no-op.
    ///
    /// # Errors
    /// Returns `ResourceBusy` with the blocked relative paths when files stay
    /// locked, or the I/O error from a failed removal
    pub async fn delete_workspace(&self, name: &str) -> Result<()> {
        validate_workspace_name(name)?;
        let path = self.workspace_path(name);
        let attempts = self.policy.attempts.max(1);
        let mut blocked = Vec::new();

        for attempt in 1..=attempts {
            if !fs::try_exists(&path).await? {
                debug!(workspace = name, "Workspace already absent");
                return Ok(());
            }

            blocked = self.scan_blocked(&path).await?;
            if blocked.is_empty() {
                match fs::remove_dir_all(&path).await {
                    Ok(()) => {
                        info!(workspace = name, attempt, "Deleted workspace");
                        return Ok(());
                    }
                    Err(err) if is_not_found(&err) => return Ok(()),
                    Err(err) if is_lock_error(&err) => {
                        if attempt == attempts {
                            return Err(Error::resource_busy(name, Vec::new()));
                        }
                        warn!(workspace = name, attempt, error = %err, "Removal hit a lock");
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                warn!(
                    workspace = name,
                    attempt,
                    attempts,
                    blocked = blocked.len(),
                    "Workspace has locked files"
                );
                if attempt == attempts {
                    break;
                }
            }

            sleep(self.policy.delay()).await;
        }

        Err(Error::resource_busy(name, blocked))
    }

    /// Returns whether the workspace directory exists.
    ///
    /// # Errors
    /// Returns an error for invalid names or unreadable roots
    pub async fn workspace_exists(&self, name: &str) -> Result<bool> {
        validate_workspace_name(name)?;
        Ok(fs::try_exists(self.workspace_path(name)).await?)
    }

    /// Lists workspace names in sorted order. A missing root yields none.
    ///
    /// Hidden directories are skipped; they can never be valid workspaces.
    ///
    /// # Errors
    /// Returns an error if the root cannot be read
    pub async fn list_workspaces(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if is_not_found(&err) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => names.push(name.to_owned()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    /// Probes every regular file under `path` and returns the blocked ones,
    /// relative to `path`.
    async fn scan_blocked(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let root = path.to_path_buf();
        let (files, mut blocked) = spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|err| Error::Other(format!("Workspace scan task failed: {err}")))?;

        for file in files {
            match self.probe.probe(&file).await {
                Ok(()) => {}
                Err(err) if is_lock_error(&err) => blocked.push(file),
                Err(err) if is_not_found(&err) => {}
                Err(err) => debug!(path = %file.display(), error = %err, "Probe failed"),
            }
        }

        Ok(blocked
            .into_iter()
            .map(|file| {
                file.strip_prefix(path)
                    .map_or_else(|_| file.clone(), Path::to_path_buf)
            })
            .collect())
    }
}

/// Walks `root` and returns `(regular files, unreadable entries)`.
fn collect_files(root: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut files = Vec::new();
    let mut unreadable = Vec::new();

    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => {
                let locked = err.io_error().is_some_and(is_lock_error);
                match err.path() {
                    Some(path) if locked => unreadable.push(path.to_path_buf()),
                    _ => {}
                }
            }
        }
    }

    (files, unreadable)
}
