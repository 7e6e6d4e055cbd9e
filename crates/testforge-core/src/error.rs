use core::result::Result as CoreResult;
use core::time::Duration;
use std::io::Error as IoError;
use std::path::PathBuf;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::types::ProjectId;

/// Result type for testforge operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors that can occur while provisioning and generating workspaces.
#[derive(Debug, Error)]
pub enum Error {
    /// A workspace with this name already exists on disk.
    #[error("Workspace already exists: {0}")]
    AlreadyExists(String),

    /// Files inside the workspace are locked by another process.
    #[error("Workspace '{workspace}' is busy ({} blocked file(s)): {suggestion}", .blocked_files.len())]
    ResourceBusy {
        /// Workspace name
        workspace: String,
        /// Paths relative to the workspace root that could not be opened
        blocked_files: Vec<PathBuf>,
        /// Operator-facing hint
        suggestion: String,
    },

    /// An external command exited non-zero or could not be spawned.
    #[error("External command `{command}` failed (exit code {exit_code:?}): {stderr}")]
    ExternalCommandFailed {
        /// Rendered command line
        command: String,
        /// Exit code, `None` when the process never ran or was killed by a signal
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// A generation attempt exceeded its time budget.
    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    /// Pre-flight checks rejected the request before any workspace mutation.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// A project sat in `pending` longer than the staleness threshold.
    #[error("Project orphaned in pending state for {0:?}")]
    Orphaned(Duration),

    /// No project record with this id.
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    /// No template registered under this name.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// A template could not be rendered.
    #[error("Template error: {0}")]
    Template(String),

    /// One or more compensation sub-steps failed.
    #[error("Cleanup failed: {}", .0.join("; "))]
    CleanupFailed(Vec<String>),

    /// The job queue is no longer accepting work.
    #[error("Job queue is closed")]
    QueueClosed,

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Determines whether a later attempt may succeed.
    ///
    /// Returns `true` for failures caused by external commands, timeouts,
    /// transient locks, and I/O.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalCommandFailed { .. }
                | Self::GenerationTimeout(_)
                | Self::ResourceBusy { .. }
                | Self::Cancelled
                | Self::Io(_)
        )
    }

    /// Builds a `ResourceBusy` error with the standard suggestion text.
    pub fn resource_busy(workspace: impl Into<String>, blocked_files: Vec<PathBuf>) -> Self {
        let suggestion = if blocked_files.is_empty() {
            "Close any editors, terminals, or test runners using the workspace and retry"
                .to_owned()
        } else {
            format!(
                "Close the programs holding {} and retry the deletion",
                blocked_files
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        Self::ResourceBusy {
            workspace: workspace.into(),
            blocked_files,
            suggestion,
        }
    }
}
