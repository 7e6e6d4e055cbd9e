//! Persistence tests for the file-backed project store.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::tests_outside_test_module,
        clippy::missing_panics_doc,
        reason = "Test file allows"
    )
)]

use std::path::PathBuf;

use serde_json::json;
use tempfile::TempDir;
use testforge_core::{
    Error, JsonProjectStore, Project, ProjectStatus, ProjectStore, ProjectUpdate,
};

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let store = JsonProjectStore::open(temp.path().join("projects"))
        .await
        .unwrap();

    let project = Project::new("orders-api", "http://localhost:8080")
        .with_path(PathBuf::from("/ws/orders-api"))
        .with_metadata("owner", json!("qa-team"));
    let id = project.id;
    store.insert(project).await.unwrap();
    store.set_status(id, ProjectStatus::Ready).await.unwrap();

    let reopened = JsonProjectStore::open(temp.path().join("projects"))
        .await
        .unwrap();
    let loaded = reopened.get(id).await.unwrap();
    assert_eq!(loaded.status, ProjectStatus::Ready);
    assert_eq!(loaded.path, PathBuf::from("/ws/orders-api"));
    assert_eq!(loaded.metadata.get("owner"), Some(&json!("qa-team")));
}

#[tokio::test]
async fn test_remove_deletes_file() {
    let temp = TempDir::new().unwrap();
    let store = JsonProjectStore::open(temp.path()).await.unwrap();

    let project = Project::new("billing-api", "http://localhost:8080");
    let id = project.id;
    store.insert(project).await.unwrap();
    assert!(temp.path().join(format!("{id}.json")).exists());

    store.remove(id).await.unwrap();
    assert!(!temp.path().join(format!("{id}.json")).exists());
    assert!(matches!(store.get(id).await, Err(Error::ProjectNotFound(_))));

    // second removal is a no-op
    store.remove(id).await.unwrap();
}

#[tokio::test]
async fn test_list_and_find_by_name() {
    let temp = TempDir::new().unwrap();
    let store = JsonProjectStore::open(temp.path()).await.unwrap();

    store
        .insert(Project::new("alpha", "http://localhost:1"))
        .await
        .unwrap();
    store
        .insert(Project::new("beta", "http://localhost:2"))
        .await
        .unwrap();

    let names: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|project| project.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"alpha".to_owned()));

    let beta = store.find_by_name("beta").await.unwrap();
    assert_eq!(beta.map(|project| project.base_url).as_deref(), Some("http://localhost:2"));
    assert!(store.find_by_name("gamma").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_update_is_not_persisted() {
    let temp = TempDir::new().unwrap();
    let store = JsonProjectStore::open(temp.path()).await.unwrap();

    let project = Project::new("orders-api", "http://localhost:8080")
        .with_path(PathBuf::from("/ws/orders-api"));
    let id = project.id;
    store.insert(project).await.unwrap();

    let result = store
        .update(id, ProjectUpdate::path(PathBuf::from("/ws/other")))
        .await;
    assert!(matches!(result, Err(Error::ValidationFailed(_))));

    let reopened = JsonProjectStore::open(temp.path()).await.unwrap();
    assert_eq!(
        reopened.get(id).await.unwrap().path,
        PathBuf::from("/ws/orders-api")
    );
}
