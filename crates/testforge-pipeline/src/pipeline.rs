use core::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use testforge_core::{
    Error, ForgeConfig, LayoutConfig, PipelineConfig, Project, ProjectGenerator, ProjectStatus,
    ProjectStore, Result, RetryPolicy,
};
use testforge_workspace::{CommandRunner, LockProbe, OpenProbe, remove_with_retry};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compensator::Compensator;
use crate::templates::{HEALTH_CHECK_FEATURE, HEALTH_CHECK_STEPS, TemplateSet, TemplateVars};

/// Ordered steps of a generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStep {
    /// Run the scaffold installer and drop its example files
    Scaffold,
    /// Create the internal directory layout
    Layout,
    /// Render configuration and fixture files
    Render,
    /// Write the synthetic feature and run the health check
    HealthCheck,
}

impl GenerationStep {
    /// Every step, in execution order.
    pub const ALL: [Self; 4] = [Self::Scaffold, Self::Layout, Self::Render, Self::HealthCheck];
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Scaffold => "scaffold",
            Self::Layout => "layout",
            Self::Render => "render",
            Self::HealthCheck => "health-check",
        };
        formatter.write_str(label)
    }
}

/// Drives one project from `pending` to `ready`.
///
/// Any failing step marks the project `failed`, runs compensation, and
/// returns the original error. The pipeline never retries on its own.
pub struct GenerationPipeline {
    store: Arc<dyn ProjectStore>,
    runner: Arc<dyn CommandRunner>,
    templates: Arc<TemplateSet>,
    compensator: Arc<Compensator>,
    probe: Arc<dyn LockProbe>,
    config: PipelineConfig,
    layout: LayoutConfig,
    lock_retry: RetryPolicy,
}

impl GenerationPipeline {
    /// Creates a pipeline from configuration and its collaborators.
    pub fn new(
        config: &ForgeConfig,
        store: Arc<dyn ProjectStore>,
        runner: Arc<dyn CommandRunner>,
        templates: Arc<TemplateSet>,
        compensator: Arc<Compensator>,
    ) -> Self {
        Self {
            store,
            runner,
            templates,
            compensator,
            probe: Arc::new(OpenProbe),
            config: config.pipeline.clone(),
            layout: config.layout.clone(),
            lock_retry: config.cleanup.lock_retry,
        }
    }

    /// Replaces the lock probe used when dropping scaffold example files.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn LockProbe>) -> Self {
        self.probe = probe;
        self
    }

    async fn run_steps(&self, project: &Project, cancel: &CancellationToken) -> Result<()> {
        let current = self
            .store
            .set_status(project.id, ProjectStatus::Pending)
            .await?;
        let workspace = workspace_dir(&current)?;
        let vars = TemplateVars::for_project(&current, &self.config);

        for step in GenerationStep::ALL {
            if cancel.is_cancelled() {
                warn!(project = %current.name, %step, "Generation cancelled before step");
                return Err(Error::Cancelled);
            }
            debug!(project = %current.name, %step, "Running step");
            match step {
                GenerationStep::Scaffold => self.scaffold(&current, &workspace, cancel).await?,
                GenerationStep::Layout => self.create_layout(&workspace).await?,
                GenerationStep::Render => self.render_files(&workspace, &vars).await?,
                GenerationStep::HealthCheck => {
                    self.health_check(&workspace, &vars, cancel).await?;
                }
            }
            info!(project = %current.name, %step, "Step finished");
        }

        self.store
            .set_status(project.id, ProjectStatus::Ready)
            .await?;
        Ok(())
    }

    async fn scaffold(
        &self,
        project: &Project,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.runner
            .run(&self.config.scaffold, workspace, cancel)
            .await?;
        if let Some(install) = &self.config.install {
            self.runner.run(install, workspace, cancel).await?;
        }

        for relative in &self.layout.example_files {
            let path = workspace.join(relative);
            match remove_with_retry(&path, self.probe.as_ref(), self.lock_retry).await {
                Ok(outcome) => {
                    debug!(project = %project.name, path = %relative.display(), ?outcome, "Example file");
                }
                Err(err) => {
                    warn!(
                        project = %project.name,
                        path = %relative.display(),
                        error = %err,
                        "Could not remove example file"
                    );
                }
            }
        }
        Ok(())
    }

    async fn create_layout(&self, workspace: &Path) -> Result<()> {
        for relative in &self.layout.directories {
            fs::create_dir_all(workspace.join(relative)).await?;
        }
        Ok(())
    }

    async fn render_files(&self, workspace: &Path, vars: &TemplateVars) -> Result<()> {
        for target in &self.layout.rendered_files {
            let contents = self.templates.render(&target.template, vars)?;
            write_file(&workspace.join(&target.path), contents).await?;
        }
        Ok(())
    }

    async fn health_check(
        &self,
        workspace: &Path,
        vars: &TemplateVars,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (template, relative) in [
            (HEALTH_CHECK_FEATURE, &self.layout.health_check_feature),
            (HEALTH_CHECK_STEPS, &self.layout.health_check_steps),
        ] {
            let contents = self.templates.render(template, vars)?;
            write_file(&workspace.join(relative), contents).await?;
        }

        self.runner
            .run(&self.config.health_check, workspace, cancel)
            .await?;
        Ok(())
    }

    async fn fail(&self, project: &Project, cause: &Error) {
        warn!(project = %project.name, error = %cause, "Generation failed");

        if let Err(err) = self
            .store
            .set_status(project.id, ProjectStatus::Failed)
            .await
        {
            error!(project = %project.name, error = %err, "Could not mark project failed");
        }

        let report = self.compensator.cleanup_failed_project(project, cause).await;
        debug!(project = %project.name, ?report, "Compensation report");
    }
}

#[async_trait]
impl ProjectGenerator for GenerationPipeline {
    async fn generate(&self, project: Project, cancel: CancellationToken) -> Result<()> {
        info!(project = %project.name, id = %project.id, "Starting generation");
        match self.run_steps(&project, &cancel).await {
            Ok(()) => {
                info!(project = %project.name, "Project ready");
                Ok(())
            }
            Err(err) => {
                self.fail(&project, &err).await;
                Err(err)
            }
        }
    }

    async fn abandon(&self, project: &Project, cause: &Error) {
        warn!(project = %project.name, "Settling abandoned generation attempt");
        self.fail(project, cause).await;
    }
}

fn workspace_dir(project: &Project) -> Result<PathBuf> {
    if project.path.as_os_str().is_empty() {
        return Err(Error::ValidationFailed(format!(
            "project '{}' has no workspace path",
            project.name
        )));
    }
    Ok(project.path.clone())
}

async fn write_file(path: &Path, contents: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, contents).await?;
    Ok(())
}
