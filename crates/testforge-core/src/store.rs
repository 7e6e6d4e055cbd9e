use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{from_str, to_string_pretty};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::types::{Project, ProjectId, ProjectStatus, ProjectUpdate};

/// Durable key/record store for projects with update-by-id semantics.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if another project uses the same name
    async fn insert(&self, project: Project) -> Result<()>;

    /// Fetches a record by id.
    ///
    /// # Errors
    /// Returns `ProjectNotFound` if the id is unknown
    async fn get(&self, id: ProjectId) -> Result<Project>;

    /// Applies a partial update and returns the updated record.
    ///
    /// # Errors
    /// Returns `ProjectNotFound` if the id is unknown, or the validation
    /// error from [`Project::apply`]
    async fn update(&self, id: ProjectId, update: ProjectUpdate) -> Result<Project>;

    /// Lists every record, oldest first.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be read
    async fn list(&self) -> Result<Vec<Project>>;

    /// Looks up a record by its unique name.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be read
    async fn find_by_name(&self, name: &str) -> Result<Option<Project>>;

    /// Removes a record. Removing an unknown id is not an error.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be written
    async fn remove(&self, id: ProjectId) -> Result<()>;

    /// Writes only the status field.
    ///
    /// # Errors
    /// Same as [`ProjectStore::update`]
    async fn set_status(&self, id: ProjectId, status: ProjectStatus) -> Result<Project> {
        self.update(id, ProjectUpdate::status(status)).await
    }
}

fn sorted(mut projects: Vec<Project>) -> Vec<Project> {
    projects.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.name.cmp(&right.name))
    });
    projects
}

/// In-memory store, used by tests and short-lived runs.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<ProjectId, Project>>,
}

impl MemoryProjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn insert(&self, project: Project) -> Result<()> {
        let mut projects = self.projects.write().await;
        if projects
            .values()
            .any(|existing| existing.name == project.name)
        {
            return Err(Error::AlreadyExists(project.name));
        }
        projects.insert(project.id, project);
        Ok(())
    }

    async fn get(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::ProjectNotFound(id))
    }

    async fn update(&self, id: ProjectId, update: ProjectUpdate) -> Result<Project> {
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(Error::ProjectNotFound(id))?;
        let mut updated = project.clone();
        updated.apply(update, Utc::now())?;
        *project = updated.clone();
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let projects = self.projects.read().await.values().cloned().collect();
        Ok(sorted(projects))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self
            .projects
            .read()
            .await
            .values()
            .find(|project| project.name == name)
            .cloned())
    }

    async fn remove(&self, id: ProjectId) -> Result<()> {
        self.projects.write().await.remove(&id);
        Ok(())
    }
}

/// File-backed store keeping one `<id>.json` file per project.
///
/// All records are loaded into memory on [`JsonProjectStore::open`]; every
/// mutation is written through to disk before the call returns.
#[derive(Debug)]
pub struct JsonProjectStore {
    storage_path: PathBuf,
    projects: Mutex<HashMap<ProjectId, Project>>,
}

impl JsonProjectStore {
    /// Opens (creating if needed) a store directory and loads every record.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or a record
    /// cannot be read or parsed
    pub async fn open(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path).await.map_err(|err| {
            Error::Other(format!(
                "Failed to create project storage directory {}: {err}",
                storage_path.display()
            ))
        })?;

        let mut projects = HashMap::new();
        let mut entries = fs::read_dir(&storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path).await?;
            let project: Project = from_str(&contents).map_err(|err| {
                Error::Other(format!(
                    "Failed to parse project file {}: {err}",
                    path.display()
                ))
            })?;
            projects.insert(project.id, project);
        }

        tracing::debug!(
            path = %storage_path.display(),
            count = projects.len(),
            "Loaded project store"
        );

        Ok(Self {
            storage_path,
            projects: Mutex::new(projects),
        })
    }

    /// Directory holding the record files.
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn project_path(&self, id: ProjectId) -> PathBuf {
        self.storage_path.join(format!("{id}.json"))
    }

    async fn persist(&self, project: &Project) -> Result<()> {
        let path = self.project_path(project.id);
        let staging = path.with_extension("json.tmp");
        let json = to_string_pretty(project)?;
        fs::write(&staging, json).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn insert(&self, project: Project) -> Result<()> {
        let mut projects = self.projects.lock().await;
        if projects
            .values()
            .any(|existing| existing.name == project.name)
        {
            return Err(Error::AlreadyExists(project.name));
        }
        self.persist(&project).await?;
        projects.insert(project.id, project);
        Ok(())
    }

    async fn get(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::ProjectNotFound(id))
    }

    async fn update(&self, id: ProjectId, update: ProjectUpdate) -> Result<Project> {
        let mut projects = self.projects.lock().await;
        let mut updated = projects
            .get(&id)
            .cloned()
            .ok_or(Error::ProjectNotFound(id))?;
        updated.apply(update, Utc::now())?;
        self.persist(&updated).await?;
        projects.insert(id, updated.clone());
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let projects = self.projects.lock().await.values().cloned().collect();
        Ok(sorted(projects))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self
            .projects
            .lock()
            .await
            .values()
            .find(|project| project.name == name)
            .cloned())
    }

    async fn remove(&self, id: ProjectId) -> Result<()> {
        let mut projects = self.projects.lock().await;
        match fs::remove_file(self.project_path(id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        projects.remove(&id);
        Ok(())
    }
}
