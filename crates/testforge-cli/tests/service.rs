//! Project lifecycle through the service facade.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use core::time::Duration;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use testforge_cli::{CreateProject, ProjectService};
use testforge_core::{
    CommandSpec, Error, ForgeConfig, MemoryProjectStore, Project, ProjectStatus, ProjectStore,
    Result, RetryPolicy,
};
use testforge_workspace::{CommandOutput, CommandRunner, LockProbe, OpenProbe};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Writes the files a scaffold would leave behind. The scaffold can be held
/// behind a gate, and the health check can fail or hang ignoring cancellation.
#[derive(Default)]
struct FakeToolchain {
    health_fails: bool,
    health_hangs: bool,
    scaffold_gate: Option<Semaphore>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.program.clone());
        if command.program == "scaffold" {
            if let Some(gate) = &self.scaffold_gate {
                drop(gate.acquire().await.unwrap());
            }
            fs::write(cwd.join("package.json"), "{}").await?;
            fs::write(cwd.join("playwright.config.ts"), "// scaffolded").await?;
        }
        if command.program == "health" && self.health_hangs {
            sleep(Duration::from_secs(3600)).await;
        }
        if command.program == "health" && self.health_fails {
            return Err(Error::ExternalCommandFailed {
                command: command.to_string(),
                exit_code: Some(1),
                stderr: "no tests found".to_owned(),
            });
        }
        Ok(CommandOutput::default())
    }
}

struct Fixture {
    temp: TempDir,
    store: Arc<MemoryProjectStore>,
    toolchain: Arc<FakeToolchain>,
    service: ProjectService,
}

fn test_config(root: &Path) -> ForgeConfig {
    let mut config = ForgeConfig::default();
    let fast = RetryPolicy::new(2, Duration::from_millis(1));
    config.workspace.root = root.to_path_buf();
    config.workspace.delete_retry = fast;
    config.cleanup.lock_retry = fast;
    config.queue.max_retries = 0;
    config.queue.drain_interval_ms = 5;
    config.pipeline.scaffold = CommandSpec::new("scaffold");
    config.pipeline.install = None;
    config.pipeline.health_check = CommandSpec::new("health");
    config
}

/// Reports files named `locked_name` as held open by another process.
struct LockedFile {
    locked_name: &'static str,
}

#[async_trait]
impl LockProbe for LockedFile {
    async fn probe(&self, path: &Path) -> IoResult<()> {
        if path.file_name().and_then(|name| name.to_str()) == Some(self.locked_name) {
            return Err(IoError::from(ErrorKind::PermissionDenied));
        }
        OpenProbe.probe(path).await
    }
}

async fn fixture(toolchain: FakeToolchain) -> Fixture {
    fixture_with(toolchain, |_| {}, Arc::new(OpenProbe)).await
}

async fn fixture_with(
    toolchain: FakeToolchain,
    adjust: impl FnOnce(&mut ForgeConfig),
    probe: Arc<dyn LockProbe>,
) -> Fixture {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(MemoryProjectStore::new());
    let toolchain = Arc::new(toolchain);
    let mut config = test_config(&temp.path().join("workspaces"));
    adjust(&mut config);
    let service = ProjectService::with_probe(
        config,
        Arc::clone(&store) as Arc<dyn ProjectStore>,
        Arc::clone(&toolchain) as Arc<dyn CommandRunner>,
        probe,
    )
    .await
    .unwrap();
    Fixture {
        temp,
        store,
        toolchain,
        service,
    }
}

#[tokio::test]
async fn test_create_generates_ready_project() {
    let fixture = fixture(FakeToolchain::default()).await;

    let created = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    assert_eq!(created.status, ProjectStatus::Pending);
    assert!(created.path.is_absolute());
    assert_eq!(created.base_url, "http://localhost:3000");

    fixture.service.wait_idle().await.unwrap();

    let project = fixture.store.get(created.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Ready);
    assert!(project.path.join("features").join("health-check.feature").exists());
    assert_eq!(
        *fixture.toolchain.calls.lock().unwrap(),
        vec!["scaffold".to_owned(), "health".to_owned()]
    );
}

#[tokio::test]
async fn test_failed_generation_is_marked_failed() {
    let fixture = fixture(FakeToolchain {
        health_fails: true,
        ..FakeToolchain::default()
    })
    .await;

    let created = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    fixture.service.wait_idle().await.unwrap();

    let project = fixture.store.get(created.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    let status = fixture.service.queue_status().await.unwrap();
    assert_eq!(status.stats.given_up, 1);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let fixture = fixture(FakeToolchain::default()).await;

    fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    let second = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await;
    assert!(matches!(second, Err(Error::AlreadyExists(name)) if name == "orders-api"));

    fixture.service.wait_idle().await.unwrap();
    assert_eq!(fixture.service.list_projects().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_request_touches_nothing() {
    let fixture = fixture(FakeToolchain::default()).await;

    let bad_url = fixture
        .service
        .create_project(CreateProject {
            base_url: Some("ftp://example.com".to_owned()),
            ..CreateProject::new("orders-api")
        })
        .await;
    assert!(matches!(bad_url, Err(Error::ValidationFailed(_))));

    for name in ["../escape", "orders\"api", "orders api"] {
        let bad_name = fixture.service.create_project(CreateProject::new(name)).await;
        assert!(matches!(bad_name, Err(Error::ValidationFailed(_))), "{name} accepted");
    }

    let quoted_url = fixture
        .service
        .create_project(CreateProject {
            base_url: Some("http://localhost:3000/\"}".to_owned()),
            ..CreateProject::new("orders-api")
        })
        .await;
    assert!(matches!(quoted_url, Err(Error::ValidationFailed(_))));

    assert!(!fixture.temp.path().join("workspaces").join("orders-api").exists());
    assert!(fixture.service.list_projects().await.unwrap().is_empty());
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_removes_workspace_and_record() {
    let fixture = fixture(FakeToolchain::default()).await;

    let created = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    fixture.service.wait_idle().await.unwrap();

    fixture.service.delete_project("orders-api").await.unwrap();
    assert!(!created.path.exists());
    assert!(fixture.service.list_projects().await.unwrap().is_empty());
    assert!(fixture.service.list_workspaces().await.unwrap().is_empty());

    // already gone
    fixture.service.delete_project("orders-api").await.unwrap();
}

#[tokio::test]
async fn test_sweep_only_touches_stale_pending_projects() {
    let fixture = fixture(FakeToolchain::default()).await;

    let mut stale = Project::new("stale", "http://localhost:3000");
    stale.created_at = Utc::now() - ChronoDuration::hours(2);
    let fresh = Project::new("fresh", "http://localhost:3000");
    let stale_id = stale.id;
    let fresh_id = fresh.id;
    fixture.store.insert(stale).await.unwrap();
    fixture.store.insert(fresh).await.unwrap();

    let swept = fixture.service.sweep_orphans().await.unwrap();
    assert_eq!(swept, vec![stale_id]);

    assert_eq!(
        fixture.store.get(stale_id).await.unwrap().status,
        ProjectStatus::Failed
    );
    assert_eq!(
        fixture.store.get(fresh_id).await.unwrap().status,
        ProjectStatus::Pending
    );
}

#[tokio::test]
async fn test_shutdown_closes_queue() {
    let fixture = fixture(FakeToolchain::default()).await;

    fixture.service.shutdown().await.unwrap();
    assert!(matches!(
        fixture.service.queue_status().await,
        Err(Error::QueueClosed)
    ));
}

#[tokio::test]
async fn test_delete_with_locked_file_keeps_record() {
    let fixture = fixture_with(
        FakeToolchain::default(),
        |_| {},
        Arc::new(LockedFile {
            locked_name: "trace.zip",
        }),
    )
    .await;

    let created = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    fixture.service.wait_idle().await.unwrap();
    fs::write(created.path.join("reports").join("trace.zip"), "zip")
        .await
        .unwrap();

    match fixture.service.delete_project("orders-api").await {
        Err(Error::ResourceBusy {
            workspace,
            blocked_files,
            ..
        }) => {
            assert_eq!(workspace, "orders-api");
            assert_eq!(blocked_files, vec![PathBuf::from("reports").join("trace.zip")]);
        }
        other => panic!("expected ResourceBusy, got {other:?}"),
    }

    let kept = fixture.store.find_by_name("orders-api").await.unwrap();
    assert_eq!(kept.map(|project| project.id), Some(created.id));
    assert!(created.path.join("package.json").exists());
}

#[tokio::test]
async fn test_sweep_skips_projects_the_queue_still_holds() {
    let fixture = fixture_with(
        FakeToolchain {
            scaffold_gate: Some(Semaphore::new(0)),
            ..FakeToolchain::default()
        },
        |config| {
            config.queue.max_concurrent = 1;
            config.cleanup.orphan_threshold_secs = 0;
        },
        Arc::new(OpenProbe),
    )
    .await;

    let running = fixture
        .service
        .create_project(CreateProject::new("running"))
        .await
        .unwrap();
    let waiting = fixture
        .service
        .create_project(CreateProject::new("waiting"))
        .await
        .unwrap();

    let mut polls = 0;
    while fixture.service.queue_status().await.unwrap().in_flight == 0 {
        assert!(polls < 400, "generation never started");
        polls += 1;
        sleep(Duration::from_millis(5)).await;
    }

    let mut lost = Project::new("lost", "http://localhost:3000");
    lost.created_at = Utc::now() - ChronoDuration::hours(2);
    let lost_id = lost.id;
    fixture.store.insert(lost).await.unwrap();

    let swept = fixture.service.sweep_orphans().await.unwrap();
    assert_eq!(swept, vec![lost_id]);

    for id in [running.id, waiting.id] {
        assert_eq!(
            fixture.store.get(id).await.unwrap().status,
            ProjectStatus::Pending
        );
    }

    if let Some(gate) = &fixture.toolchain.scaffold_gate {
        gate.add_permits(2);
    }
    fixture.service.wait_idle().await.unwrap();

    for id in [running.id, waiting.id] {
        assert_eq!(
            fixture.store.get(id).await.unwrap().status,
            ProjectStatus::Ready
        );
    }
}

#[tokio::test]
async fn test_attempt_ignoring_cancellation_still_ends_failed() {
    let fixture = fixture_with(
        FakeToolchain {
            health_hangs: true,
            ..FakeToolchain::default()
        },
        |config| {
            config.queue.attempt_timeout_secs = 1;
            config.queue.cancel_grace_ms = 100;
        },
        Arc::new(OpenProbe),
    )
    .await;

    let created = fixture
        .service
        .create_project(CreateProject::new("orders-api"))
        .await
        .unwrap();
    fixture.service.wait_idle().await.unwrap();

    let stats = fixture.service.queue_status().await.unwrap().stats;
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.given_up, 1);

    let project = fixture.store.get(created.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert!(created.path.is_dir());
    assert!(!created.path.join(".env").exists());
    assert!(!created.path.join("features").join("health-check.feature").exists());
}
