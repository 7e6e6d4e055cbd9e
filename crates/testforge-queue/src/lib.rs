//! Bounded-concurrency priority queue driving project generation.

/// Queue items and introspection types.
pub mod item;
/// The dispatcher and its handle.
pub mod queue;

pub use item::{DEFAULT_PRIORITY, PendingEntry, QueueDetails, QueueItem, QueueStats, QueueStatus};
pub use queue::JobQueue;
