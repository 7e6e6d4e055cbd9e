use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::Project;

/// Turns a `pending` project into a `ready` one.
///
/// The job queue drives implementations of this trait. One call is one
/// attempt; retries are the caller's concern.
#[async_trait]
pub trait ProjectGenerator: Send + Sync {
    /// Runs a single generation attempt.
    ///
    /// Implementations should return `Error::Cancelled` promptly once
    /// `cancel` fires and must leave the project record in a terminal state
    /// before returning an error.
    ///
    /// # Errors
    /// Returns the error that failed the attempt
    async fn generate(&self, project: Project, cancel: CancellationToken) -> Result<()>;

    /// Settles a project whose attempt was aborted because it ignored
    /// cancellation.
    ///
    /// Called after the aborted attempt has been dropped, so nothing else is
    /// touching the project when it runs. Implementations that keep state
    /// must move the record to a terminal state here.
    async fn abandon(&self, _project: &Project, _cause: &Error) {}
}
