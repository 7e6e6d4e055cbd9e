//! Configuration types for workspaces, the job queue, the pipeline, and cleanup.

use core::fmt;
use core::time::Duration;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the workspaces root.
pub const ENV_WORKSPACES_ROOT: &str = "TESTFORGE_WORKSPACES_ROOT";
/// Environment variable overriding the default base URL.
pub const ENV_BASE_URL: &str = "TESTFORGE_BASE_URL";

/// Complete testforge configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Workspace store settings
    pub workspace: WorkspaceConfig,
    /// Job queue settings
    pub queue: QueueConfig,
    /// Generation pipeline settings
    pub pipeline: PipelineConfig,
    /// Compensation settings
    pub cleanup: CleanupConfig,
    /// Fixed relative paths inside every workspace
    pub layout: LayoutConfig,
}

/// Fixed-delay retry policy for lock-sensitive filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub attempts: u32,
    /// Delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt count and delay.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1_000,
        }
    }
}

/// Workspace store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding one subdirectory per workspace
    pub root: PathBuf,
    /// Retry policy for deleting workspaces with locked files
    pub delete_retry: RetryPolicy,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspaces"),
            delete_retry: RetryPolicy::default(),
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum pipeline attempts running at once
    pub max_concurrent: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Time budget of a single attempt in seconds
    pub attempt_timeout_secs: u64,
    /// Pause before re-running a drain pass that left work behind
    pub drain_interval_ms: u64,
    /// Extra delay before a failed item re-enters the queue
    pub retry_backoff_ms: u64,
    /// How long a timed-out attempt may take to wind down after cancellation
    pub cancel_grace_ms: u64,
}

impl QueueConfig {
    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Delay between drain passes.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Delay before a retried item is re-queued.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Grace period granted to cancelled attempts.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 3,
            attempt_timeout_secs: 300,
            drain_interval_ms: 1_000,
            retry_backoff_ms: 0,
            cancel_grace_ms: 30_000,
        }
    }
}

/// An external command: program, arguments, and extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments passed verbatim
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Creates a command without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.program)?;
        for arg in &self.args {
            write!(formatter, " {arg}")?;
        }
        Ok(())
    }
}

/// Generation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base URL used when a request does not carry one
    pub base_url: String,
    /// Author rendered into generated files
    pub author: String,
    /// Description rendered into generated files
    pub description: String,
    /// Scaffold installer run in the empty workspace
    pub scaffold: CommandSpec,
    /// Dependency installer run after scaffolding
    pub install: Option<CommandSpec>,
    /// Health-check runner
    pub health_check: CommandSpec,
    /// Directory of `<name>.tmpl` files overriding the built-in templates
    pub templates_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_owned(),
            author: "testforge".to_owned(),
            description: "Automated API test project".to_owned(),
            scaffold: CommandSpec::new("npm").with_args([
                "init",
                "playwright@latest",
                "--yes",
                "--",
                "--quiet",
                "--lang=ts",
                "--no-browsers",
                "--gha=false",
            ]),
            install: Some(CommandSpec::new("npm").with_args(["install"])),
            health_check: CommandSpec::new("npx").with_args(["playwright", "test", "--list"]),
            templates_dir: None,
        }
    }
}

/// Compensation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Retry policy for files that are locked during removal
    pub lock_retry: RetryPolicy,
    /// Age after which a `pending` project counts as orphaned
    pub orphan_threshold_secs: u64,
}

impl CleanupConfig {
    /// Orphan staleness threshold.
    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            lock_retry: RetryPolicy::default(),
            orphan_threshold_secs: 30 * 60,
        }
    }
}

/// A rendered file: template name and relative output path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTarget {
    /// Template name
    pub template: String,
    /// Output path relative to the workspace root
    pub path: PathBuf,
}

impl TemplateTarget {
    /// Creates a target.
    pub fn new(template: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            path: path.into(),
        }
    }
}

/// Fixed relative paths inside every workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Internal directories created after scaffolding
    pub directories: Vec<PathBuf>,
    /// Example files dropped by the scaffold installer
    pub example_files: Vec<PathBuf>,
    /// Files rendered from templates
    pub rendered_files: Vec<TemplateTarget>,
    /// Files removed by compensation
    pub generated_files: Vec<PathBuf>,
    /// Installed-dependency artifacts removed by compensation
    pub dependency_artifacts: Vec<PathBuf>,
    /// Temporary and report directories removed by compensation
    pub temp_directories: Vec<PathBuf>,
    /// Package descriptor reset to baseline by compensation
    pub package_file: PathBuf,
    /// Runner configuration reset to baseline by compensation
    pub runner_config_file: PathBuf,
    /// Synthetic feature written by the health check
    pub health_check_feature: PathBuf,
    /// Step definitions backing the synthetic feature
    pub health_check_steps: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        let paths = |items: &[&str]| items.iter().map(PathBuf::from).collect::<Vec<_>>();
        Self {
            directories: paths(&["features", "steps", "support", "fixtures", "reports"]),
            example_files: paths(&[
                "tests/example.spec.ts",
                "tests-examples/demo-todo-app.spec.ts",
                "e2e/example.spec.ts",
            ]),
            rendered_files: vec![
                TemplateTarget::new("package", "package.json"),
                TemplateTarget::new("runner-config", "playwright.config.ts"),
                TemplateTarget::new("env", ".env"),
                TemplateTarget::new("world", "support/world.ts"),
                TemplateTarget::new("hooks", "support/hooks.ts"),
                TemplateTarget::new("fixtures", "fixtures/api-data.json"),
            ],
            generated_files: paths(&[
                ".env",
                "support/world.ts",
                "support/hooks.ts",
                "fixtures/api-data.json",
                "features/health-check.feature",
                "steps/health-check.steps.ts",
            ]),
            dependency_artifacts: paths(&["node_modules", "package-lock.json"]),
            temp_directories: paths(&["test-results", "reports", "playwright-report", ".cache"]),
            package_file: PathBuf::from("package.json"),
            runner_config_file: PathBuf::from("playwright.config.ts"),
            health_check_feature: PathBuf::from("features/health-check.feature"),
            health_check_steps: PathBuf::from("steps/health-check.steps.ts"),
        }
    }
}

impl ForgeConfig {
    /// Get the default config directory path (`~/.testforge`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_owned()))?;
        Ok(home.join(".testforge"))
    }

    /// Get the default config file path (`~/.testforge/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it with defaults if missing.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|error| Error::Config(format!("Failed to read config: {error}")))?;
        let config: Self = toml::from_str(&contents)?;

        tracing::debug!(
            path = %path.display(),
            root = %config.workspace.root.display(),
            max_concurrent = config.queue.max_concurrent,
            "Loaded config"
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                Error::Config(format!("Failed to create config directory: {error}"))
            })?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|error| Error::Config(format!("Failed to serialize config: {error}")))?;

        let header = "# testforge configuration file\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}"))
            .map_err(|error| Error::Config(format!("Failed to write config: {error}")))?;

        Ok(())
    }

    /// Apply `TESTFORGE_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_WORKSPACES_ROOT).filter(|value| !value.is_empty()) {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|value| !value.is_empty()) {
            self.pipeline.base_url = base_url;
        }
        self
    }

    /// Pre-flight checks run before any workspace is touched.
    ///
    /// # Errors
    /// Returns `ValidationFailed` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.workspace.root.as_os_str().is_empty() {
            return Err(Error::ValidationFailed(
                "workspace.root must not be empty".to_owned(),
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(Error::ValidationFailed(
                "queue.max_concurrent must be at least 1".to_owned(),
            ));
        }
        if self.queue.attempt_timeout_secs == 0 {
            return Err(Error::ValidationFailed(
                "queue.attempt_timeout_secs must be at least 1".to_owned(),
            ));
        }
        for (label, policy) in [
            ("workspace.delete_retry", self.workspace.delete_retry),
            ("cleanup.lock_retry", self.cleanup.lock_retry),
        ] {
            if policy.attempts == 0 {
                return Err(Error::ValidationFailed(format!(
                    "{label}.attempts must be at least 1"
                )));
            }
        }
        for (label, command) in [
            ("pipeline.scaffold", &self.pipeline.scaffold),
            ("pipeline.health_check", &self.pipeline.health_check),
        ] {
            if command.program.trim().is_empty() {
                return Err(Error::ValidationFailed(format!(
                    "{label}.program must not be empty"
                )));
            }
        }
        validate_base_url(&self.pipeline.base_url)
    }
}

/// Checks that a base URL is an absolute http(s) URL.
///
/// Quotes, backslashes and whitespace are rejected since the URL is rendered
/// verbatim into JSON, TypeScript and Gherkin files.
///
/// # Errors
/// Returns `ValidationFailed` for anything else
pub fn validate_base_url(base_url: &str) -> Result<()> {
    if base_url
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control() || matches!(ch, '"' | '\'' | '\\' | '`'))
    {
        return Err(Error::ValidationFailed(format!(
            "base URL '{base_url}' contains quotes, backslashes or whitespace"
        )));
    }
    let rest = base_url
        .strip_prefix("http://")
        .or_else(|| base_url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(Error::ValidationFailed(format!(
            "base URL '{base_url}' must be an absolute http(s) URL"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = ForgeConfig::default();
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.attempt_timeout(), Duration::from_secs(300));
        assert_eq!(config.workspace.delete_retry.attempts, 3);
        assert_eq!(config.cleanup.lock_retry.delay(), Duration::from_secs(1));
        assert_eq!(config.cleanup.orphan_threshold(), Duration::from_secs(1800));
        if let Err(error) = config.validate() {
            panic!("default config should validate: {error}");
        }
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_content = r#"
[workspace]
root = "/srv/workspaces"

[queue]
max_concurrent = 4

[pipeline.health_check]
program = "npx"
args = ["bddgen", "test"]
"#;
        let mut file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(error) => panic!("temp file: {error}"),
        };
        if let Err(error) = file.write_all(toml_content.as_bytes()) {
            panic!("write failed: {error}");
        }

        let config = match ForgeConfig::load_from_file(file.path()) {
            Ok(config) => config,
            Err(error) => panic!("load failed: {error}"),
        };
        assert_eq!(config.workspace.root, PathBuf::from("/srv/workspaces"));
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.pipeline.health_check.to_string(), "npx bddgen test");
        assert_eq!(config.layout, LayoutConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = match TempDir::new() {
            Ok(temp) => temp,
            Err(error) => panic!("temp dir: {error}"),
        };
        let path = temp.path().join("nested").join("config.toml");
        let mut config = ForgeConfig::default();
        config.queue.retry_backoff_ms = 250;

        if let Err(error) = config.save_to_file(&path) {
            panic!("save failed: {error}");
        }
        let reloaded = match ForgeConfig::load_from_file(&path) {
            Ok(config) => config,
            Err(error) => panic!("reload failed: {error}"),
        };
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let config = ForgeConfig::default().with_overrides_from(|key| match key {
            ENV_WORKSPACES_ROOT => Some("/tmp/ws".to_owned()),
            ENV_BASE_URL => Some("https://api.example.com".to_owned()),
            _ => None,
        });
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/ws"));
        assert_eq!(config.pipeline.base_url, "https://api.example.com");

        let untouched = ForgeConfig::default().with_overrides_from(|_| Some(String::new()));
        assert_eq!(untouched.workspace.root, PathBuf::from("workspaces"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ForgeConfig::default();
        config.queue.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(Error::ValidationFailed(_))));

        let mut config = ForgeConfig::default();
        config.pipeline.base_url = "localhost:3000".to_owned();
        assert!(matches!(config.validate(), Err(Error::ValidationFailed(_))));

        let mut config = ForgeConfig::default();
        config.cleanup.lock_retry.attempts = 0;
        assert!(matches!(config.validate(), Err(Error::ValidationFailed(_))));
    }

    #[test]
    fn test_validate_base_url() {
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("https://api.example.com/v1").is_ok());
        assert!(validate_base_url("https://").is_err());
        assert!(validate_base_url("ftp://files").is_err());
        assert!(validate_base_url("http://host/\"x").is_err());
        assert!(validate_base_url("http://host/'x").is_err());
        assert!(validate_base_url("http://host /x").is_err());
    }

    #[test]
    fn test_command_display() {
        let command = CommandSpec::new("npm")
            .with_args(["install", "--no-audit"])
            .with_env("CI", "1");
        assert_eq!(command.to_string(), "npm install --no-audit");
        assert_eq!(command.env.get("CI").map(String::as_str), Some("1"));
    }
}
