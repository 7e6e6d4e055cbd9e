//! Reverts the side effects of a failed generation.
//!
//! Every sub-step is best-effort. Errors that are neither "not found" nor an
//! exhausted lock retry are collected; if any remain once all sub-steps ran,
//! the whole workspace is deleted as a last resort.

use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use testforge_core::{
    Error, ForgeConfig, LayoutConfig, PipelineConfig, Project, ProjectId, ProjectStatus, Result,
    RetryPolicy,
};
use testforge_workspace::{
    LockProbe, OpenProbe, RemovalOutcome, WorkspaceStore, remove_path, remove_with_retry,
};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::templates::{BASELINE_PACKAGE, BASELINE_RUNNER_CONFIG, TemplateSet, TemplateVars};

/// Outcome of one `cleanup_failed_project` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Generated files that were deleted
    pub removed_files: Vec<PathBuf>,
    /// Generated files left in place because they stayed locked
    pub locked_files: Vec<PathBuf>,
    /// Dependency artifacts that were deleted
    pub removed_artifacts: Vec<PathBuf>,
    /// Temporary directories that were deleted
    pub removed_temp_dirs: Vec<PathBuf>,
    /// Whether both baseline files were rewritten
    pub baseline_restored: bool,
    /// Non-ignorable sub-step failures
    pub errors: Vec<String>,
    /// Whether emergency cleanup ran
    pub escalated: bool,
    /// Whether emergency cleanup deleted the workspace
    pub workspace_deleted: bool,
}

impl CleanupReport {
    /// Whether every sub-step finished without a non-ignorable error.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compensation for failed and orphaned projects.
pub struct Compensator {
    workspaces: WorkspaceStore,
    templates: Arc<TemplateSet>,
    layout: LayoutConfig,
    pipeline: PipelineConfig,
    probe: Arc<dyn LockProbe>,
    lock_retry: RetryPolicy,
    orphan_threshold: Duration,
}

impl Compensator {
    /// Creates a compensator from configuration.
    pub fn new(
        config: &ForgeConfig,
        workspaces: WorkspaceStore,
        templates: Arc<TemplateSet>,
    ) -> Self {
        Self {
            workspaces,
            templates,
            layout: config.layout.clone(),
            pipeline: config.pipeline.clone(),
            probe: Arc::new(OpenProbe),
            lock_retry: config.cleanup.lock_retry,
            orphan_threshold: config.cleanup.orphan_threshold(),
        }
    }

    /// Replaces the lock probe used for generated files.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn LockProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Reverts a failed project's workspace to a known-good baseline.
    ///
    /// Never returns an error: sub-step failures escalate to emergency
    /// cleanup and everything else is logged.
    pub async fn cleanup_failed_project(&self, project: &Project, cause: &Error) -> CleanupReport {
        let mut report = CleanupReport::default();
        let root = self.workspace_root(project);

        match fs::try_exists(&root).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(project = %project.name, "Workspace absent, nothing to compensate");
                return report;
            }
            Err(err) => report.errors.push(format!("inspect workspace: {err}")),
        }

        info!(project = %project.name, cause = %cause, "Compensating failed generation");

        if report.errors.is_empty() {
            self.remove_generated_files(&root, &mut report).await;
            remove_paths(
                &root,
                &self.layout.dependency_artifacts,
                &mut report.removed_artifacts,
                &mut report.errors,
            )
            .await;
            remove_paths(
                &root,
                &self.layout.temp_directories,
                &mut report.removed_temp_dirs,
                &mut report.errors,
            )
            .await;
            match self.restore_baseline(project, &root).await {
                Ok(()) => report.baseline_restored = true,
                Err(err) => report.errors.push(format!("restore baseline: {err}")),
            }
        }

        if report.is_clean() {
            info!(
                project = %project.name,
                removed = report.removed_files.len(),
                locked = report.locked_files.len(),
                "Compensation finished"
            );
        } else {
            let failure = Error::CleanupFailed(report.errors.clone());
            error!(project = %project.name, error = %failure, "Compensation failed, escalating");
            report.escalated = true;
            report.workspace_deleted = self.emergency_cleanup(project).await;
        }

        report
    }

    /// Deletes the entire workspace. Returns whether it is gone.
    pub async fn emergency_cleanup(&self, project: &Project) -> bool {
        match self.workspaces.delete_workspace(&project.name).await {
            Ok(()) => {
                warn!(project = %project.name, "Emergency cleanup deleted workspace");
                true
            }
            Err(err) => {
                error!(
                    project = %project.name,
                    error = %err,
                    "Emergency cleanup failed, workspace needs manual removal"
                );
                false
            }
        }
    }

    /// Compensates every `pending` project older than the orphan threshold.
    ///
    /// Returns the ids that were handled.
    pub async fn cleanup_orphaned_projects(
        &self,
        projects: &[Project],
        now: DateTime<Utc>,
    ) -> Vec<ProjectId> {
        let mut handled = Vec::new();
        for project in projects {
            if project.status != ProjectStatus::Pending {
                continue;
            }
            let age = project.age(now);
            if age <= self.orphan_threshold {
                continue;
            }

            let cause = Error::Orphaned(age);
            warn!(project = %project.name, age_secs = age.as_secs(), "Found orphaned project");
            self.cleanup_failed_project(project, &cause).await;
            handled.push(project.id);
        }
        handled
    }

    fn workspace_root(&self, project: &Project) -> PathBuf {
        if project.path.as_os_str().is_empty() {
            self.workspaces.workspace_path(&project.name)
        } else {
            project.path.clone()
        }
    }

    async fn remove_generated_files(&self, root: &Path, report: &mut CleanupReport) {
        for relative in &self.layout.generated_files {
            let path = root.join(relative);
            match remove_with_retry(&path, self.probe.as_ref(), self.lock_retry).await {
                Ok(RemovalOutcome::Removed) => report.removed_files.push(relative.clone()),
                Ok(RemovalOutcome::Missing) => {}
                Ok(RemovalOutcome::GaveUp) => report.locked_files.push(relative.clone()),
                Err(err) => report
                    .errors
                    .push(format!("remove {}: {err}", relative.display())),
            }
        }
    }

    async fn restore_baseline(&self, project: &Project, root: &Path) -> Result<()> {
        let vars = TemplateVars::for_project(project, &self.pipeline);
        for (template, relative) in [
            (BASELINE_PACKAGE, &self.layout.package_file),
            (BASELINE_RUNNER_CONFIG, &self.layout.runner_config_file),
        ] {
            let contents = self.templates.render(template, &vars)?;
            fs::write(root.join(relative), contents).await?;
        }
        Ok(())
    }
}

/// Removes files or directory trees, ignoring the ones that are already gone.
async fn remove_paths(
    root: &Path,
    targets: &[PathBuf],
    removed: &mut Vec<PathBuf>,
    errors: &mut Vec<String>,
) {
    for relative in targets {
        match remove_path(&root.join(relative)).await {
            Ok(true) => removed.push(relative.clone()),
            Ok(false) => {}
            Err(err) => errors.push(format!("remove {}: {err}", relative.display())),
        }
    }
}
