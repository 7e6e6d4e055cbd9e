use chrono::{DateTime, Utc};
use serde::Serialize;
use testforge_core::{Project, ProjectId};

/// Default priority of an enqueued project.
pub const DEFAULT_PRIORITY: i32 = 1;

/// A pending generation request.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Project to generate
    pub project: Project,
    /// Higher runs first
    pub priority: i32,
    /// Refreshed on every retry
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far
    pub retries: u32,
}

impl QueueItem {
    /// Creates a fresh item.
    pub fn new(project: Project, priority: i32) -> Self {
        Self {
            project,
            priority,
            enqueued_at: Utc::now(),
            retries: 0,
        }
    }

    /// Project identifier.
    pub fn id(&self) -> ProjectId {
        self.project.id
    }
}

/// Lifetime counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Attempts that finished successfully
    pub succeeded: u64,
    /// Attempts that failed, including timeouts
    pub failed_attempts: u64,
    /// Attempts that exceeded the timeout
    pub timed_out: u64,
    /// Timed-out attempts dropped after the cancellation grace period
    pub abandoned: u64,
    /// Items dropped after running out of retries
    pub given_up: u64,
}

/// Point-in-time counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Items waiting to run
    pub pending: usize,
    /// Items currently running
    pub in_flight: usize,
    /// Failed items waiting out their retry backoff
    pub backing_off: usize,
    /// Lifetime counters
    pub stats: QueueStats,
}

impl QueueStatus {
    /// Nothing pending, running, or backing off.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_flight == 0 && self.backing_off == 0
    }
}

/// One pending item as reported by `queue_details`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    /// Project identifier
    pub id: ProjectId,
    /// Project name
    pub name: String,
    /// Priority
    pub priority: i32,
    /// Failed attempts so far
    pub retries: u32,
    /// Last enqueue time
    pub enqueued_at: DateTime<Utc>,
}

impl From<&QueueItem> for PendingEntry {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.project.id,
            name: item.project.name.clone(),
            priority: item.priority,
            retries: item.retries,
            enqueued_at: item.enqueued_at,
        }
    }
}

/// Pending items in run order plus the in-flight set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDetails {
    /// Pending items, next to run first
    pub pending: Vec<PendingEntry>,
    /// Projects currently running
    pub in_flight: Vec<ProjectId>,
    /// Failed projects waiting out their retry backoff
    pub backing_off: Vec<ProjectId>,
}

impl QueueDetails {
    /// Whether the queue still holds work for `id` in any state.
    pub fn holds(&self, id: ProjectId) -> bool {
        self.in_flight.contains(&id)
            || self.backing_off.contains(&id)
            || self.pending.iter().any(|entry| entry.id == id)
    }
}
