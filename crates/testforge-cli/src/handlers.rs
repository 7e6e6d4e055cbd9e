//! Command handlers behind the `testforge` binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use serde_json::to_string_pretty;
use testforge_core::{ForgeConfig, JsonProjectStore, Project, ProjectStatus};
use testforge_workspace::ProcessRunner;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::service::{CreateProject, ProjectService};

/// Directory under the workspaces root that holds tool state.
pub const STATE_DIR: &str = ".testforge";

/// Write a line to stdout.
#[allow(clippy::print_stdout, reason = "CLI output")]
fn print_line(line: &str) {
    println!("{line}");
}

/// Resolves the configuration for one invocation.
///
/// An explicit `--config` file is created with defaults when missing. Env
/// overrides apply on top, and `--root` wins over both.
///
/// # Errors
/// Returns an error if the config file cannot be read or written
pub fn load_config(config_path: Option<&Path>, root: Option<PathBuf>) -> Result<ForgeConfig> {
    let config = match config_path {
        Some(path) if path.exists() => ForgeConfig::load_from_file(path)?,
        Some(path) => {
            let config = ForgeConfig::default();
            config.save_to_file(path)?;
            config
        }
        None => ForgeConfig::load_or_create()?,
    };

    let mut config = config.with_env_overrides();
    if let Some(root) = root {
        config.workspace.root = root;
    }
    Ok(config)
}

/// Directory of the persisted project records for a workspaces root.
pub fn projects_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("projects")
}

/// Runs one parsed command line to completion.
///
/// # Errors
/// Returns an error if the command fails
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), cli.root)?;
    let store = JsonProjectStore::open(projects_dir(&config.workspace.root))
        .await
        .context("Failed to open project store")?;
    let service = ProjectService::new(config, Arc::new(store), Arc::new(ProcessRunner)).await?;

    let outcome = dispatch(&service, cli.command).await;
    service.shutdown().await?;
    outcome
}

async fn dispatch(service: &ProjectService, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            base_url,
            priority,
        } => handle_create(service, name, base_url, priority).await,
        Commands::Delete { name } => handle_delete(service, &name).await,
        Commands::List { json } => handle_list(service, json).await,
        Commands::Sweep => handle_sweep(service).await,
        Commands::Status => handle_status(service).await,
    }
}

async fn handle_create(
    service: &ProjectService,
    name: String,
    base_url: Option<String>,
    priority: i32,
) -> Result<()> {
    let created = service
        .create_project(CreateProject {
            name,
            base_url,
            priority,
        })
        .await?;
    info!(project = %created.name, path = %created.path.display(), "Generating project");

    service.wait_idle().await?;

    let project = service
        .list_projects()
        .await?
        .into_iter()
        .find(|project| project.id == created.id)
        .with_context(|| format!("Project '{}' disappeared during generation", created.name))?;

    print_line(&format_project(&project));
    if project.status != ProjectStatus::Ready {
        bail!("Generation of '{}' did not complete", project.name);
    }
    Ok(())
}

async fn handle_delete(service: &ProjectService, name: &str) -> Result<()> {
    service.delete_project(name).await?;
    print_line(&format!("Deleted {name}"));
    Ok(())
}

async fn handle_list(service: &ProjectService, json: bool) -> Result<()> {
    let projects = service.list_projects().await?;
    if json {
        print_line(&to_string_pretty(&projects)?);
        return Ok(());
    }
    if projects.is_empty() {
        print_line("No projects");
        return Ok(());
    }
    for project in &projects {
        print_line(&format_project(project));
    }
    Ok(())
}

async fn handle_sweep(service: &ProjectService) -> Result<()> {
    let swept = service.sweep_orphans().await?;
    print_line(&format!("Swept {} orphaned project(s)", swept.len()));
    Ok(())
}

async fn handle_status(service: &ProjectService) -> Result<()> {
    let workspaces = service.list_workspaces().await?;
    let projects = service.list_projects().await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for project in &projects {
        *by_status.entry(project.status.to_string()).or_default() += 1;
    }

    print_line(&format!(
        "Root: {}",
        service.config().workspace.root.display()
    ));
    print_line(&format!("Workspaces: {}", workspaces.len()));
    for (status, count) in &by_status {
        print_line(&format!("  {status}: {count}"));
    }
    Ok(())
}

fn format_project(project: &Project) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        project.name,
        project.status,
        project.base_url,
        project.path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_config_is_created_with_defaults() {
        let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let path = temp.path().join("nested").join("config.toml");

        let config = load_config(Some(&path), None).unwrap_or_else(|err| panic!("{err}"));
        assert!(path.exists());
        assert_eq!(config.queue.max_concurrent, ForgeConfig::default().queue.max_concurrent);
    }

    #[test]
    fn test_root_flag_overrides_file() {
        let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let path = temp.path().join("config.toml");
        fs::write(&path, "[workspace]\nroot = \"/from/file\"\n")
            .unwrap_or_else(|err| panic!("write: {err}"));

        let root = temp.path().join("cli-root");
        let config =
            load_config(Some(&path), Some(root.clone())).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(config.workspace.root, root);
    }

    #[test]
    fn test_state_lives_under_hidden_dir() {
        assert_eq!(
            projects_dir(Path::new("/ws")),
            Path::new("/ws").join(".testforge").join("projects")
        );
    }
}
