//! Caller-facing project operations.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use testforge_core::config::validate_base_url;
use testforge_core::{
    Error, ForgeConfig, Project, ProjectId, ProjectStatus, ProjectStore, Result,
};
use testforge_pipeline::{Compensator, GenerationPipeline, TemplateSet};
use testforge_queue::{DEFAULT_PRIORITY, JobQueue, QueueStatus};
use testforge_workspace::{
    CommandRunner, LockProbe, OpenProbe, WorkspaceStore, validate_workspace_name,
};
use tracing::{error, info, warn};

/// A request to create and generate a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateProject {
    /// Unique project and workspace name
    pub name: String,
    /// Base URL of the API under test; the configured default when `None`
    pub base_url: Option<String>,
    /// Queue priority, higher runs first
    pub priority: i32,
}

impl CreateProject {
    /// Request with the default base URL and priority.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Wires the workspace store, the generation pipeline and the job queue
/// behind the operations a caller needs.
pub struct ProjectService {
    config: ForgeConfig,
    store: Arc<dyn ProjectStore>,
    workspaces: WorkspaceStore,
    compensator: Arc<Compensator>,
    queue: JobQueue,
}

impl ProjectService {
    /// Builds the service with the default lock probe.
    ///
    /// Must be called inside a tokio runtime, since it starts the queue
    /// dispatcher.
    ///
    /// # Errors
    /// Returns `ValidationFailed` for an invalid configuration, or an error
    /// if template overrides cannot be loaded
    pub async fn new(
        config: ForgeConfig,
        store: Arc<dyn ProjectStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        Self::with_probe(config, store, runner, Arc::new(OpenProbe)).await
    }

    /// Builds the service with a custom lock probe.
    ///
    /// # Errors
    /// Same as [`ProjectService::new`]
    pub async fn with_probe(
        config: ForgeConfig,
        store: Arc<dyn ProjectStore>,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn LockProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let templates =
            Arc::new(TemplateSet::load(config.pipeline.templates_dir.as_deref()).await?);
        let workspaces = WorkspaceStore::with_probe(
            &config.workspace.root,
            config.workspace.delete_retry,
            Arc::clone(&probe),
        );
        let compensator = Arc::new(
            Compensator::new(&config, workspaces.clone(), Arc::clone(&templates))
                .with_probe(Arc::clone(&probe)),
        );
        let pipeline = GenerationPipeline::new(
            &config,
            Arc::clone(&store),
            runner,
            templates,
            Arc::clone(&compensator),
        )
        .with_probe(probe);
        let queue = JobQueue::new(config.queue.clone(), Arc::new(pipeline));

        Ok(Self {
            config,
            store,
            workspaces,
            compensator,
            queue,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Validates the request, creates the workspace, persists the record,
    /// and queues generation. Returns the persisted `pending` project.
    ///
    /// # Errors
    /// Returns `ValidationFailed` before touching the disk, `AlreadyExists`
    /// on a name collision, or the error from persisting or queueing
    pub async fn create_project(&self, request: CreateProject) -> Result<Project> {
        validate_workspace_name(&request.name)?;
        let base_url = request
            .base_url
            .unwrap_or_else(|| self.config.pipeline.base_url.clone());
        validate_base_url(&base_url)?;

        if self.store.find_by_name(&request.name).await?.is_some() {
            return Err(Error::AlreadyExists(request.name));
        }

        let path = self.workspaces.create_workspace(&request.name).await?;
        let project = Project::new(&request.name, base_url).with_path(path);

        if let Err(err) = self.store.insert(project.clone()).await {
            self.discard_workspace(&request.name).await;
            return Err(err);
        }

        info!(
            project = %project.name,
            id = %project.id,
            priority = request.priority,
            "Project created"
        );
        self.queue.enqueue(project.clone(), request.priority)?;
        Ok(project)
    }

    /// Deletes the workspace directory, then the project record.
    ///
    /// The record is kept when the directory cannot be removed.
    ///
    /// # Errors
    /// Returns `ResourceBusy` with the blocked files, or the store error
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let project = self.store.find_by_name(name).await?;
        self.workspaces.delete_workspace(name).await?;

        if let Some(project) = project {
            self.store.remove(project.id).await?;
            info!(project = name, id = %project.id, "Project deleted");
        } else {
            info!(project = name, "Workspace deleted, no project record");
        }
        Ok(())
    }

    /// Every project record, oldest first.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.store.list().await
    }

    /// Workspace directories on disk.
    ///
    /// # Errors
    /// Returns an error if the root cannot be read
    pub async fn list_workspaces(&self) -> Result<Vec<String>> {
        self.workspaces.list_workspaces().await
    }

    /// Compensates stale `pending` projects the queue no longer holds and
    /// marks them `failed`.
    ///
    /// Projects that are queued, running, or waiting out a retry backoff are
    /// left alone.
    ///
    /// # Errors
    /// Returns an error if the store or the queue cannot be queried
    pub async fn sweep_orphans(&self) -> Result<Vec<ProjectId>> {
        let details = self.queue.queue_details().await?;
        let candidates: Vec<Project> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|project| !details.holds(project.id))
            .collect();

        let handled = self
            .compensator
            .cleanup_orphaned_projects(&candidates, Utc::now())
            .await;

        for id in &handled {
            if let Err(err) = self.store.set_status(*id, ProjectStatus::Failed).await {
                error!(id = %id, error = %err, "Could not mark orphaned project failed");
            }
        }
        if !handled.is_empty() {
            warn!(count = handled.len(), "Swept orphaned projects");
        }
        Ok(handled)
    }

    /// Queue counts.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the queue has stopped
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.queue.queue_status().await
    }

    /// Waits until every queued generation has finished.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the queue has stopped
    pub async fn wait_idle(&self) -> Result<()> {
        self.queue.wait_idle().await
    }

    /// Stops the queue after running attempts finish.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the queue had already stopped
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown().await
    }

    /// Directory that holds the workspace for `name`.
    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.workspaces.workspace_path(name)
    }

    async fn discard_workspace(&self, name: &str) {
        if let Err(err) = self.workspaces.delete_workspace(name).await {
            error!(project = name, error = %err, "Could not remove workspace of unsaved project");
        }
    }
}
