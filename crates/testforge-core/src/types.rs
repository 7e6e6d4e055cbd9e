use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|err| Error::ValidationFailed(format!("invalid project id '{value}': {err}")))
    }
}

/// Generation status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Created, generation not yet finished
    Pending,
    /// Generation finished and the health check passed
    Ready,
    /// Generation or cleanup failed
    Failed,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        formatter.write_str(label)
    }
}

/// Persisted record describing one generated test project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier
    pub id: ProjectId,
    /// Unique name, also the workspace directory name
    pub name: String,
    /// Absolute workspace path, empty until the workspace is created
    #[serde(default)]
    pub path: PathBuf,
    /// Base URL of the API under test
    pub base_url: String,
    /// Current generation status
    pub status: ProjectStatus,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Creates a new `pending` project without a workspace path.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            path: PathBuf::new(),
            base_url: base_url.into(),
            status: ProjectStatus::Pending,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the workspace path on a freshly built record.
    #[must_use]
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Time elapsed since creation, saturating at zero for clock skew.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Applies a partial update and bumps `updated_at`.
    ///
    /// # Errors
    /// Returns `ValidationFailed` when the update would overwrite an
    /// already-set path, or would mark the project ready without a path.
    pub fn apply(&mut self, update: ProjectUpdate, now: DateTime<Utc>) -> Result<()> {
        if let Some(path) = update.path {
            if !self.path.as_os_str().is_empty() && self.path != path {
                return Err(Error::ValidationFailed(format!(
                    "workspace path of project '{}' is already set",
                    self.name
                )));
            }
            self.path = path;
        }

        if let Some(status) = update.status {
            if status == ProjectStatus::Ready && self.path.as_os_str().is_empty() {
                return Err(Error::ValidationFailed(format!(
                    "project '{}' cannot be ready without a workspace path",
                    self.name
                )));
            }
            self.status = status;
        }

        if let Some(metadata) = update.metadata {
            self.metadata.extend(metadata);
        }

        self.updated_at = now;
        Ok(())
    }
}

/// Partial update applied to a project by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectUpdate {
    /// New status
    pub status: Option<ProjectStatus>,
    /// Workspace path, may only be set once
    pub path: Option<PathBuf>,
    /// Metadata entries merged into the existing map
    pub metadata: Option<BTreeMap<String, JsonValue>>,
}

impl ProjectUpdate {
    /// Update that only changes the status.
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that only sets the workspace path.
    pub fn path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            ..Self::default()
        }
    }
}
