//! Polling dispatcher: feeds pending tasks to the executor, one at a time.
//!
//! Each poll first fails IN_PROGRESS tasks whose lease expired, then claims
//! the oldest PENDING task. An empty queue or a queue error sleeps a fixed
//! interval; a processed task is followed by an immediate poll. The loop only
//! ends when the cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alphred_core::events::{EventPayload, TaskClaimedPayload, TaskReclaimedPayload};
use alphred_core::{Id, Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::executor::{TaskExecutor, TaskOutcome};
use crate::registry::CapabilityRegistry;
use crate::storage::{Storage, StorageError};

/// Result written when the worker shuts down mid-task.
pub const STOPPED_RESULT: &str = "worker stopped before the task finished";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// The task store as seen by the worker.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Atomically move the oldest PENDING task to IN_PROGRESS.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Task>, QueueError>;

    async fn renew_lease(&self, id: &Id, lease: Duration) -> Result<(), QueueError>;

    /// IN_PROGRESS -> terminal. `Ok(false)` if the task was not IN_PROGRESS.
    async fn finish(&self, id: &Id, status: TaskStatus, result: &str) -> Result<bool, QueueError>;

    /// Fail IN_PROGRESS tasks whose lease expired before `now`.
    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError>;

    /// Append to the task audit log.
    async fn record(&self, task_id: &Id, payload: &EventPayload) -> Result<(), QueueError>;
}

#[async_trait]
impl TaskQueue for Storage {
    async fn claim_next(&self, lease: Duration) -> Result<Option<Task>, QueueError> {
        Ok(self.claim_next_task(lease).await?)
    }

    async fn renew_lease(&self, id: &Id, lease: Duration) -> Result<(), QueueError> {
        Ok(Storage::renew_lease(self, id, lease).await?)
    }

    async fn finish(&self, id: &Id, status: TaskStatus, result: &str) -> Result<bool, QueueError> {
        Ok(self.finish_task(id, status, result).await?)
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        Ok(self.reclaim_stale_tasks(now).await?)
    }

    async fn record(&self, task_id: &Id, payload: &EventPayload) -> Result<(), QueueError> {
        self.append_event(task_id, payload).await?;
        Ok(())
    }
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    polls: AtomicU64,
    idle_polls: AtomicU64,
    queue_errors: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    reclaimed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub polls: u64,
    pub idle_polls: u64,
    pub queue_errors: u64,
    pub completed: u64,
    pub failed: u64,
    pub reclaimed: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    fn record_outcome(&self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// What one poll did.
#[derive(Debug)]
pub enum PollResult {
    Idle,
    Executed(TaskOutcome),
    QueueError,
}

#[derive(Debug)]
pub struct PollingDispatcher {
    queue: Arc<dyn TaskQueue>,
    executor: TaskExecutor,
    registry: CapabilityRegistry,
    poll_interval: Duration,
    lease: Duration,
    skill: String,
    stats: Arc<DispatcherStats>,
}

impl std::fmt::Debug for dyn TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskQueue")
    }
}

impl PollingDispatcher {
    /// The dispatcher owns `registry` for its whole lifetime.
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        executor: TaskExecutor,
        registry: CapabilityRegistry,
        poll_interval: Duration,
        lease: Duration,
        skill: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            executor,
            registry,
            poll_interval,
            lease,
            skill: skill.into(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Reclaim, claim and (if a task was claimed) execute it to completion.
    pub async fn poll_once(&mut self) -> PollResult {
        match self.claim().await {
            Err(()) => PollResult::QueueError,
            Ok(None) => PollResult::Idle,
            Ok(Some(task)) => {
                let outcome = self.executor.execute(&task, &mut self.registry).await;
                self.stats.record_outcome(outcome.status);
                PollResult::Executed(outcome)
            }
        }
    }

    /// Poll until `cancel` fires, then release every provider session.
    pub async fn run(mut self, cancel: CancellationToken) -> StatsSnapshot {
        info!(
            interval = ?self.poll_interval,
            skill = %self.skill,
            "dispatcher started, polling for tasks"
        );

        while !cancel.is_cancelled() {
            let claimed = tokio::select! {
                claimed = self.claim() => claimed,
                () = cancel.cancelled() => break,
            };

            let task = match claimed {
                Ok(Some(task)) => task,
                Ok(None) | Err(()) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.poll_interval) => {}
                        () = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            let outcome = tokio::select! {
                outcome = self.executor.execute(&task, &mut self.registry) => Some(outcome),
                () = cancel.cancelled() => None,
            };
            match outcome {
                Some(outcome) => self.stats.record_outcome(outcome.status),
                None => {
                    warn!(task_id = %task.id, "shutdown requested mid-task");
                    if self.executor.finish(&task, TaskStatus::Failed, STOPPED_RESULT).await {
                        self.stats.record_outcome(TaskStatus::Failed);
                    }
                    break;
                }
            }
        }

        self.registry.shutdown().await;
        let stats = self.stats.snapshot();
        info!(
            polls = stats.polls,
            completed = stats.completed,
            failed = stats.failed,
            reclaimed = stats.reclaimed,
            "dispatcher stopped"
        );
        stats
    }

    /// One poll against the queue. `Err(())` means the queue failed and was logged.
    async fn claim(&self) -> Result<Option<Task>, ()> {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        match self.queue.reclaim_stale(now).await {
            Ok(reclaimed) => {
                for task in reclaimed {
                    self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                    warn!(task_id = %task.id, title = %task.title, "task lease expired, marked failed");
                    let payload = EventPayload::TaskReclaimed(TaskReclaimedPayload {
                        lease_expired_at: task
                            .lease_expires_at
                            .map_or(now.timestamp_millis(), |t| t.timestamp_millis()),
                    });
                    self.record(&task.id, &payload).await;
                }
            }
            Err(err) => {
                self.stats.queue_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "failed to reclaim stale tasks");
                return Err(());
            }
        }

        match self.queue.claim_next(self.lease).await {
            Ok(Some(task)) => {
                info!(task_id = %task.id, title = %task.title, "claimed task");
                let payload = EventPayload::TaskClaimed(TaskClaimedPayload {
                    skill: self.skill.clone(),
                    lease_expires_at: task
                        .lease_expires_at
                        .map_or(0, |t| t.timestamp_millis()),
                });
                self.record(&task.id, &payload).await;
                Ok(Some(task))
            }
            Ok(None) => {
                self.stats.idle_polls.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => {
                self.stats.queue_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "failed to poll task queue");
                Err(())
            }
        }
    }

    async fn record(&self, task_id: &Id, payload: &EventPayload) {
        if let Err(err) = self.queue.record(task_id, payload).await {
            warn!(task_id = %task_id, error = %err, "failed to record task event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::llm::mock::ScriptedModel;
    use crate::llm::Completion;
    use crate::session::SessionConfig;
    use crate::skills::Skill;
    use std::sync::Mutex;

    /// In-memory queue; no I/O, so it is safe under paused time.
    #[derive(Default)]
    struct FakeQueue {
        pending: Mutex<Vec<Task>>,
        finished: Mutex<Vec<(Id, TaskStatus, String)>>,
        claims: AtomicU64,
        fail_polls: AtomicU64,
    }

    #[async_trait]
    impl TaskQueue for FakeQueue {
        async fn claim_next(&self, lease: Duration) -> Result<Option<Task>, QueueError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            if self.fail_polls.load(Ordering::SeqCst) > 0 {
                self.fail_polls.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Unavailable("connection refused".to_string()));
            }
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return Ok(None);
            }
            let mut task = pending.remove(0);
            task.status = TaskStatus::InProgress;
            task.lease_expires_at = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap());
            Ok(Some(task))
        }

        async fn renew_lease(&self, _id: &Id, _lease: Duration) -> Result<(), QueueError> {
            Ok(())
        }

        async fn finish(&self, id: &Id, status: TaskStatus, result: &str) -> Result<bool, QueueError> {
            self.finished
                .lock()
                .unwrap()
                .push((id.clone(), status, result.to_string()));
            Ok(true)
        }

        async fn reclaim_stale(&self, _now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
            Ok(Vec::new())
        }

        async fn record(&self, _task_id: &Id, _payload: &EventPayload) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn dispatcher(queue: Arc<FakeQueue>, model: ScriptedModel) -> PollingDispatcher {
        let config = ExecutorConfig {
            skill: "general".to_string(),
            max_turns: 10,
            llm_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(60),
        };
        let executor = TaskExecutor::new(Arc::new(model), Arc::clone(&queue) as _, config);
        let mut registry = CapabilityRegistry::new(SessionConfig::default());
        registry.register(Skill::new("general", "d", "p"));
        PollingDispatcher::new(
            queue,
            executor,
            registry,
            Duration::from_secs(5),
            Duration::from_secs(60),
            "general",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_sleeps_fixed_interval_between_polls() {
        let queue = Arc::new(FakeQueue::default());
        let dispatcher = dispatcher(Arc::clone(&queue), ScriptedModel::new(Vec::new()));
        let stats = dispatcher.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        // Polls at t=0, 5s, 10s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(queue.claims.load(Ordering::SeqCst), 3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.idle_polls, 3);
        assert_eq!(snapshot.completed + snapshot.failed, 0);
        assert!(!handle.is_finished());

        cancel.cancel();
        let final_stats = handle.await.unwrap();
        assert_eq!(final_stats.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_errors_retry_at_fixed_interval() {
        let queue = Arc::new(FakeQueue::default());
        queue.fail_polls.store(2, Ordering::SeqCst);
        queue.pending.lock().unwrap().push(Task::new("t", "d"));
        let dispatcher = dispatcher(
            Arc::clone(&queue),
            ScriptedModel::new(vec![Completion::text("Done.")]),
        );
        let stats = dispatcher.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        // Two failures at t=0 and t=5s, success at t=10s.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queue_errors, 2);
        assert_eq!(snapshot.completed, 1);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
        let finished = queue.finished.lock().unwrap();
        assert_eq!(finished[0].1, TaskStatus::Completed);
        assert_eq!(finished[0].2, "Done.");
    }

    #[tokio::test]
    async fn failed_task_does_not_stop_polling() {
        let queue = Arc::new(FakeQueue::default());
        queue.pending.lock().unwrap().push(Task::new("first", "d"));
        queue.pending.lock().unwrap().push(Task::new("second", "d"));
        let model = ScriptedModel::new(Vec::new())
            .then_error("provider exploded");
        let mut dispatcher = dispatcher(Arc::clone(&queue), model);

        let first = dispatcher.poll_once().await;
        assert!(matches!(
            first,
            PollResult::Executed(TaskOutcome { status: TaskStatus::Failed, .. })
        ));
        // Script exhausted: the second task fails too, but is still processed.
        let second = dispatcher.poll_once().await;
        assert!(matches!(second, PollResult::Executed(_)));
        assert!(matches!(dispatcher.poll_once().await, PollResult::Idle));

        let snapshot = dispatcher.stats().snapshot();
        assert_eq!(snapshot.failed, 2);
        assert_eq!(queue.finished.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dispatcher_processes_oldest_first_with_storage() {
        use crate::storage::tests::{create_test_storage, pending_task};

        let ts = create_test_storage().await;
        let newer = pending_task("newer", 5);
        let older = pending_task("older", 50);
        ts.storage.insert_task(&newer).await.unwrap();
        ts.storage.insert_task(&older).await.unwrap();

        let queue: Arc<dyn TaskQueue> = Arc::clone(&ts.storage) as _;
        let model = ScriptedModel::new(vec![Completion::text("one"), Completion::text("two")]);
        let executor = TaskExecutor::new(
            Arc::new(model),
            Arc::clone(&queue),
            ExecutorConfig {
                skill: "general".to_string(),
                max_turns: 10,
                llm_timeout: Duration::from_secs(5),
                lease: Duration::from_secs(60),
            },
        );
        let mut registry = CapabilityRegistry::new(SessionConfig::default());
        registry.register(Skill::new("general", "d", "p"));
        let mut dispatcher = PollingDispatcher::new(
            queue,
            executor,
            registry,
            Duration::from_secs(5),
            Duration::from_secs(60),
            "general",
        );

        dispatcher.poll_once().await;
        let older = ts.storage.get_task(&older.id).await.unwrap();
        assert_eq!(older.status, TaskStatus::Completed);
        assert_eq!(older.result.as_deref(), Some("one"));
        let newer_state = ts.storage.get_task(&newer.id).await.unwrap();
        assert_eq!(newer_state.status, TaskStatus::Pending);

        let events = ts.storage.list_events(&older.id).await.unwrap();
        assert_eq!(events[0].event_type, "TASK_CLAIMED");
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed_on_poll() {
        use crate::storage::tests::{create_test_storage, pending_task};
        use crate::storage::LEASE_EXPIRED_RESULT;

        let ts = create_test_storage().await;
        let mut orphan = pending_task("orphan", 60);
        orphan.status = TaskStatus::InProgress;
        orphan.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        ts.storage.insert_task(&orphan).await.unwrap();

        let queue: Arc<dyn TaskQueue> = Arc::clone(&ts.storage) as _;
        let executor = TaskExecutor::new(
            Arc::new(ScriptedModel::new(Vec::new())),
            Arc::clone(&queue),
            ExecutorConfig {
                skill: "general".to_string(),
                max_turns: 10,
                llm_timeout: Duration::from_secs(5),
                lease: Duration::from_secs(60),
            },
        );
        let mut dispatcher = PollingDispatcher::new(
            queue,
            executor,
            CapabilityRegistry::new(SessionConfig::default()),
            Duration::from_secs(5),
            Duration::from_secs(60),
            "general",
        );

        assert!(matches!(dispatcher.poll_once().await, PollResult::Idle));
        let stored = ts.storage.get_task(&orphan.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.result.as_deref(), Some(LEASE_EXPIRED_RESULT));
        assert_eq!(dispatcher.stats().snapshot().reclaimed, 1);

        let events = ts.storage.list_events(&orphan.id).await.unwrap();
        assert_eq!(events[0].event_type, "TASK_RECLAIMED");
    }
}
