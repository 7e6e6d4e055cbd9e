//! Priority job queue with bounded concurrency, per-attempt timeouts and
//! retries.
//!
//! All queue state lives in a single dispatcher task. [`JobQueue`] handles
//! talk to it over an unbounded command channel, and attempts report back
//! through a `JoinSet`, so no lock is ever held across an await.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use testforge_core::{Error, Project, ProjectGenerator, ProjectId, QueueConfig, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::item::{PendingEntry, QueueDetails, QueueItem, QueueStats, QueueStatus};

enum Command {
    Enqueue(QueueItem),
    Status(oneshot::Sender<QueueStatus>),
    Details(oneshot::Sender<QueueDetails>),
    Clear(oneshot::Sender<usize>),
    WaitIdle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running job queue.
///
/// Cloning is cheap. The dispatcher keeps running queued work after the last
/// handle is dropped and exits once it is idle.
#[derive(Clone)]
pub struct JobQueue {
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl JobQueue {
    /// Starts a dispatcher task on the current tokio runtime.
    pub fn new(config: QueueConfig, generator: Arc<dyn ProjectGenerator>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(config, generator, receiver);
        drop(tokio::spawn(dispatcher.run()));
        Self {
            commands,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queues a generation attempt for `project`.
    ///
    /// Higher priorities run first; equal priorities run in arrival order.
    ///
    /// # Errors
    /// Returns `QueueClosed` after [`JobQueue::shutdown`]
    pub fn enqueue(&self, project: Project, priority: i32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        debug!(project = %project.name, priority, "Enqueueing project");
        self.send(Command::Enqueue(QueueItem::new(project, priority)))
    }

    /// Current counts.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the dispatcher has exited
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.request(Command::Status).await
    }

    /// Pending items in run order and the in-flight set.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the dispatcher has exited
    pub async fn queue_details(&self) -> Result<QueueDetails> {
        self.request(Command::Details).await
    }

    /// Drops every pending item and returns how many were dropped.
    ///
    /// Running attempts are unaffected.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the dispatcher has exited
    pub async fn clear_queue(&self) -> Result<usize> {
        self.request(Command::Clear).await
    }

    /// Resolves once nothing is pending, running, or backing off.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the dispatcher has exited
    pub async fn wait_idle(&self) -> Result<()> {
        self.request(Command::WaitIdle).await
    }

    /// Stops accepting work, drops pending items, and waits for running
    /// attempts to finish.
    ///
    /// # Errors
    /// Returns `QueueClosed` if the dispatcher had already exited
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.request(Command::Shutdown).await
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::QueueClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| Error::QueueClosed)
    }
}

/// Result of one attempt as seen by the dispatcher.
struct AttemptOutcome {
    item: QueueItem,
    result: Result<()>,
    timed_out: bool,
    abandoned: bool,
    _permit: OwnedSemaphorePermit,
}

struct Dispatcher {
    config: QueueConfig,
    generator: Arc<dyn ProjectGenerator>,
    commands: mpsc::UnboundedReceiver<Command>,
    channel_open: bool,
    pending: VecDeque<QueueItem>,
    in_flight: HashSet<ProjectId>,
    semaphore: Arc<Semaphore>,
    attempts: JoinSet<AttemptOutcome>,
    backoffs: JoinSet<QueueItem>,
    backing_off: Vec<ProjectId>,
    redrain_at: Option<Instant>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    shutdown_waiters: Option<Vec<oneshot::Sender<()>>>,
    stats: QueueStats,
}

impl Dispatcher {
    fn new(
        config: QueueConfig,
        generator: Arc<dyn ProjectGenerator>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            config,
            generator,
            commands,
            channel_open: true,
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            semaphore: Arc::new(Semaphore::new(permits)),
            attempts: JoinSet::new(),
            backoffs: JoinSet::new(),
            backing_off: Vec::new(),
            redrain_at: None,
            idle_waiters: Vec::new(),
            shutdown_waiters: None,
            stats: QueueStats::default(),
        }
    }

    async fn run(mut self) {
        debug!(
            max_concurrent = self.config.max_concurrent,
            max_retries = self.config.max_retries,
            "Job queue dispatcher started"
        );

        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.handle(command);
            }

            self.drain();
            self.notify_idle();
            if self.should_exit() {
                break;
            }

            let redrain_deadline = self.redrain_at.unwrap_or_else(Instant::now);
            tokio::select! {
                command = self.commands.recv(), if self.channel_open => match command {
                    Some(command) => self.handle(command),
                    None => self.channel_open = false,
                },
                Some(joined) = self.attempts.join_next(), if !self.attempts.is_empty() => {
                    self.finish_attempt(joined);
                }
                Some(joined) = self.backoffs.join_next(), if !self.backoffs.is_empty() => {
                    match joined {
                        Ok(item) => self.resume(item),
                        Err(err) => debug!(error = %err, "Backoff task ended early"),
                    }
                }
                () = sleep_until(redrain_deadline), if self.redrain_at.is_some() => {
                    self.redrain_at = None;
                }
                else => break,
            }
        }

        if let Some(waiters) = self.shutdown_waiters.take() {
            for waiter in waiters {
                drop(waiter.send(()));
            }
        }
        debug!("Job queue dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(item) => {
                if self.shutdown_waiters.is_some() {
                    warn!(project = %item.project.name, "Queue shutting down, dropping item");
                    return;
                }
                self.insert_by_priority(item);
            }
            Command::Status(reply) => drop(reply.send(self.status())),
            Command::Details(reply) => drop(reply.send(self.details())),
            Command::Clear(reply) => {
                let dropped = self.pending.len();
                self.pending.clear();
                info!(dropped, "Cleared pending queue items");
                drop(reply.send(dropped));
            }
            Command::WaitIdle(reply) => self.idle_waiters.push(reply),
            Command::Shutdown(reply) => {
                let dropped = self.pending.len();
                self.pending.clear();
                self.backoffs.abort_all();
                self.backing_off.clear();
                info!(
                    dropped,
                    in_flight = self.in_flight.len(),
                    "Job queue shutting down"
                );
                self.shutdown_waiters.get_or_insert_with(Vec::new).push(reply);
            }
        }
    }

    /// Requeues an item whose retry backoff has elapsed.
    fn resume(&mut self, item: QueueItem) {
        if let Some(index) = self.backing_off.iter().position(|id| *id == item.id()) {
            self.backing_off.swap_remove(index);
        }
        self.pending.push_back(item);
    }

    /// Inserts before the first item of strictly lower priority.
    fn insert_by_priority(&mut self, item: QueueItem) {
        let index = self
            .pending
            .iter()
            .position(|existing| existing.priority < item.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, item);
    }

    /// Starts as many pending items as the concurrency bound allows.
    fn drain(&mut self) {
        while !self.pending.is_empty() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(item) = self.pending.pop_front() else {
                break;
            };

            if self.in_flight.contains(&item.id()) {
                debug!(project = %item.project.name, "Project already running, deferring");
                self.pending.push_front(item);
                drop(permit);
                break;
            }

            self.in_flight.insert(item.id());
            info!(
                project = %item.project.name,
                priority = item.priority,
                attempt = item.retries + 1,
                "Starting generation attempt"
            );
            self.attempts.spawn(run_attempt(
                Arc::clone(&self.generator),
                item,
                self.config.attempt_timeout(),
                self.config.cancel_grace(),
                permit,
            ));
        }

        if !self.pending.is_empty() && self.redrain_at.is_none() {
            self.redrain_at = Some(Instant::now() + self.config.drain_interval());
        }
    }

    fn finish_attempt(&mut self, joined: core::result::Result<AttemptOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Attempt task failed to join");
                return;
            }
        };
        let AttemptOutcome {
            mut item,
            result,
            timed_out,
            abandoned,
            _permit,
        } = outcome;

        self.in_flight.remove(&item.id());
        if timed_out {
            self.stats.timed_out += 1;
        }
        if abandoned {
            self.stats.abandoned += 1;
        }

        let err = match result {
            Ok(()) => {
                self.stats.succeeded += 1;
                info!(project = %item.project.name, attempt = item.retries + 1, "Generation succeeded");
                return;
            }
            Err(err) => err,
        };
        self.stats.failed_attempts += 1;

        if item.retries < self.config.max_retries && self.shutdown_waiters.is_none() {
            item.retries += 1;
            item.enqueued_at = Utc::now();
            warn!(
                project = %item.project.name,
                retries = item.retries,
                max_retries = self.config.max_retries,
                retryable = err.is_retryable(),
                error = %err,
                "Generation attempt failed, requeueing"
            );
            let backoff = self.config.retry_backoff();
            if backoff.is_zero() {
                self.pending.push_back(item);
            } else {
                self.backing_off.push(item.id());
                self.backoffs.spawn(async move {
                    sleep(backoff).await;
                    item
                });
            }
        } else {
            self.stats.given_up += 1;
            error!(
                project = %item.project.name,
                attempts = item.retries + 1,
                error = %err,
                "Generation failed, giving up"
            );
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.in_flight.is_empty()
            && self.attempts.is_empty()
            && self.backoffs.is_empty()
    }

    fn notify_idle(&mut self) {
        if self.is_idle() {
            for waiter in self.idle_waiters.drain(..) {
                drop(waiter.send(()));
            }
        }
    }

    fn should_exit(&self) -> bool {
        let stopping = self.shutdown_waiters.is_some() || !self.channel_open;
        stopping && self.is_idle()
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            backing_off: self.backoffs.len(),
            stats: self.stats,
        }
    }

    fn details(&self) -> QueueDetails {
        let mut in_flight: Vec<ProjectId> = self.in_flight.iter().copied().collect();
        in_flight.sort();
        QueueDetails {
            pending: self.pending.iter().map(PendingEntry::from).collect(),
            in_flight,
            backing_off: self.backing_off.clone(),
        }
    }
}

/// Races one generation against the attempt timeout.
///
/// On timeout the attempt's token is cancelled and the generation gets
/// `grace` to wind down. Past that it is aborted and the generator's
/// `abandon` hook settles the project before the outcome is reported.
async fn run_attempt(
    generator: Arc<dyn ProjectGenerator>,
    item: QueueItem,
    attempt_timeout: Duration,
    grace: Duration,
    permit: OwnedSemaphorePermit,
) -> AttemptOutcome {
    let cancel = CancellationToken::new();
    let project = item.project.clone();
    let token = cancel.clone();
    let attempt = Arc::clone(&generator);
    let mut handle = tokio::spawn(async move { attempt.generate(project, token).await });

    let mut timed_out = false;
    let mut abandoned = false;
    let result = tokio::select! {
        joined = &mut handle => flatten(joined),
        () = sleep(attempt_timeout) => {
            timed_out = true;
            warn!(
                project = %item.project.name,
                timeout_secs = attempt_timeout.as_secs(),
                "Generation attempt timed out, cancelling"
            );
            cancel.cancel();
            match timeout(grace, &mut handle).await {
                Ok(joined) => {
                    if let Err(err) = flatten(joined) {
                        debug!(project = %item.project.name, error = %err, "Cancelled attempt finished");
                    }
                }
                Err(_) => {
                    abandoned = true;
                    handle.abort();
                    warn!(
                        project = %item.project.name,
                        grace_secs = grace.as_secs(),
                        "Attempt ignored cancellation, abandoning it"
                    );
                }
            }
            Err(Error::GenerationTimeout(attempt_timeout))
        }
    };

    if abandoned {
        // the aborted future must be gone before anything else touches the workspace
        if let Err(err) = handle.await {
            debug!(project = %item.project.name, error = %err, "Abandoned attempt dropped");
        }
        if let Err(cause) = &result {
            generator.abandon(&item.project, cause).await;
        }
    }

    AttemptOutcome {
        item,
        result,
        timed_out,
        abandoned,
        _permit: permit,
    }
}

fn flatten(joined: core::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|err| Error::Other(format!("Generation task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn item(name: &str, priority: i32) -> QueueItem {
        QueueItem::new(Project::new(name, "http://localhost:8080"), priority)
    }

    fn dispatcher() -> Dispatcher {
        struct Never;

        #[async_trait]
        impl ProjectGenerator for Never {
            async fn generate(&self, _project: Project, _cancel: CancellationToken) -> Result<()> {
                Ok(())
            }
        }

        let (_sender, receiver) = mpsc::unbounded_channel();
        Dispatcher::new(QueueConfig::default(), Arc::new(Never), receiver)
    }

    #[test]
    fn test_priority_insertion_keeps_arrival_order_for_ties() {
        let mut dispatcher = dispatcher();
        dispatcher.insert_by_priority(item("low", 1));
        dispatcher.insert_by_priority(item("high", 5));
        dispatcher.insert_by_priority(item("mid-a", 3));
        dispatcher.insert_by_priority(item("mid-b", 3));
        dispatcher.insert_by_priority(item("high-2", 5));

        let order: Vec<&str> = dispatcher
            .pending
            .iter()
            .map(|item| item.project.name.as_str())
            .collect();
        assert_eq!(order, vec!["high", "high-2", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_fresh_dispatcher_is_idle() {
        let dispatcher = dispatcher();
        assert!(dispatcher.is_idle());
        assert!(dispatcher.status().is_idle());
        assert!(dispatcher.details().pending.is_empty());
    }
}
