//! Filesystem and process primitives for testforge workspaces.
//!
//! Everything here touches the outside world: workspace directories that other
//! processes may hold open, and the external toolchains the pipeline shells
//! out to.

/// Classification of filesystem errors.
pub mod fs_errors;
/// Lock detection for individual files.
pub mod probe;
/// Best-effort removal of files that may be locked.
pub mod removal;
/// External command execution.
pub mod runner;
/// Named workspace directories under a root.
pub mod store;

pub use fs_errors::{is_lock_error, is_not_found};
pub use probe::{LockProbe, OpenProbe};
pub use removal::{RemovalOutcome, remove_path, remove_with_retry};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use store::{WorkspaceStore, validate_workspace_name};
