use std::io::Result as IoResult;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::OpenOptions;

/// Checks whether a single file can currently be opened for writing.
#[async_trait]
pub trait LockProbe: Send + Sync {
    /// Opens and immediately closes `path`.
    ///
    /// # Errors
    /// Returns the raw I/O error; callers classify it with
    /// [`crate::is_lock_error`] and [`crate::is_not_found`]
    async fn probe(&self, path: &Path) -> IoResult<()>;
}

/// Probe that opens the file read-write.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenProbe;

#[async_trait]
impl LockProbe for OpenProbe {
    async fn probe(&self, path: &Path) -> IoResult<()> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        drop(file);
        Ok(())
    }
}
