//! Core types and traits for the testforge workspace generator.
//!
//! This crate provides the project model, error handling, configuration, and
//! the persistence and generation seams shared by the pipeline and the queue.

/// Configuration loading and defaults.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// The seam between the job queue and the generation pipeline.
pub mod generator;
/// Project persistence.
pub mod store;
/// Project record types.
pub mod types;

pub use config::{
    CleanupConfig, CommandSpec, ForgeConfig, LayoutConfig, PipelineConfig, QueueConfig,
    RetryPolicy, TemplateTarget, WorkspaceConfig,
};
pub use error::{Error, Result};
pub use generator::ProjectGenerator;
pub use store::{JsonProjectStore, MemoryProjectStore, ProjectStore};
pub use types::{Project, ProjectId, ProjectStatus, ProjectUpdate};
