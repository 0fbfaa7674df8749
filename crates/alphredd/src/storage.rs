//! SQLite storage module for the assistant daemon.
//!
//! Persists tasks (the worker's queue), the task audit log, and chat memory.
//! Task claiming and terminal writes are single conditional statements so two
//! workers sharing a database can never claim or finish the same task twice.

use std::path::Path;
use std::time::Duration;

use alphred_core::events::EventPayload;
use alphred_core::{Id, MemoryEntry, Task, TaskEvent, TaskStatus};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;

/// Explicit column list for tasks table queries.
/// Keeps row mapping independent of physical column order (ALTER TABLE appends).
const TASK_COLUMNS: &str =
    "id, title, description, status, result, created_at, updated_at, lease_expires_at";

/// Result written to tasks whose claim lease ran out.
pub const LEASE_EXPIRED_RESULT: &str =
    "task lease expired before completion (worker crashed or was stopped)";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task {0} is not in progress")]
    NotInProgress(String),
    #[error("invalid terminal status: {0}")]
    InvalidTerminalStatus(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_add_task_lease.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // Re-running an applied migration.
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task operations ---

    /// Insert a new task.
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, description, status, result, created_at, updated_at,
                               lease_expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(task.id.as_ref())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.lease_expires_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;

        Ok(row.into_task())
    }

    /// List tasks newest first, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(status.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    /// Atomically claim the oldest PENDING task.
    ///
    /// The task moves to IN_PROGRESS with a lease of `lease` from now. Returns
    /// `None` when nothing is pending or another worker won the race.
    pub async fn claim_next_task(&self, lease: Duration) -> Result<Option<Task>> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let query = format!(
            "UPDATE tasks SET status = 'IN_PROGRESS', updated_at = ?1, lease_expires_at = ?2 \
             WHERE id = (SELECT id FROM tasks WHERE status = 'PENDING' \
                         ORDER BY created_at ASC, rowid ASC LIMIT 1) \
               AND status = 'PENDING' \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(now.timestamp_millis())
            .bind(lease_until.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(TaskRow::into_task))
    }

    /// Push the lease of an IN_PROGRESS task to `lease` from now.
    pub async fn renew_lease(&self, id: &Id, lease: Duration) -> Result<()> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let result = sqlx::query(
            "UPDATE tasks SET lease_expires_at = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'IN_PROGRESS'",
        )
        .bind(lease_until.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotInProgress(id.to_string()));
        }
        Ok(())
    }

    /// Terminal write: IN_PROGRESS -> COMPLETED | FAILED.
    ///
    /// Returns `false` (and changes nothing) if the task is not IN_PROGRESS,
    /// so a terminal task can never be rewritten.
    pub async fn finish_task(&self, id: &Id, status: TaskStatus, result: &str) -> Result<bool> {
        if !TaskStatus::InProgress.can_transition_to(status) {
            return Err(StorageError::InvalidTerminalStatus(status.as_str()));
        }
        let now = Utc::now().timestamp_millis();
        let outcome = sqlx::query(
            "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = 'IN_PROGRESS'",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Fail every IN_PROGRESS task whose lease expired before `now`.
    pub async fn reclaim_stale_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let query = format!(
            "UPDATE tasks SET status = 'FAILED', result = ?1, updated_at = ?2 \
             WHERE status = 'IN_PROGRESS' AND lease_expires_at IS NOT NULL \
               AND lease_expires_at < ?2 \
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(LEASE_EXPIRED_RESULT)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    // --- Event operations ---

    /// Append an event to the task audit log.
    pub async fn append_event(&self, task_id: &Id, payload: &EventPayload) -> Result<TaskEvent> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO task_events (id, task_id, type, ts, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(task_id.as_ref())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(TaskEvent {
            id,
            task_id: task_id.clone(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// List events for a task in insertion order.
    pub async fn list_events(&self, task_id: &Id) -> Result<Vec<TaskEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, task_id, type, ts, payload_json FROM task_events \
             WHERE task_id = ?1 ORDER BY ts ASC, rowid ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Memory operations ---

    /// Remember one chat utterance.
    pub async fn insert_memory(&self, role: &str, content: &str) -> Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Id::new(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO memories (id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(entry.id.as_ref())
            .bind(&entry.role)
            .bind(&entry.content)
            .bind(entry.created_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(entry)
    }

    /// The newest `limit` memories, returned oldest first.
    pub async fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        let rows = sqlx::query_as::<_, MemoryRow>(
            "SELECT id, role, content, created_at FROM memories \
             ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<MemoryEntry> = rows.into_iter().map(MemoryRow::into_entry).collect();
        entries.reverse();
        Ok(entries)
    }

    /// Memories containing any of `terms` (case-insensitive), newest first.
    pub async fn search_memories(&self, terms: &[String], limit: usize) -> Result<Vec<MemoryEntry>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let clauses = vec!["content LIKE ? ESCAPE '\\'"; terms.len()].join(" OR ");
        let query = format!(
            "SELECT id, role, content, created_at FROM memories WHERE {clauses} \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let mut q = sqlx::query_as::<_, MemoryRow>(&query);
        for term in terms {
            q = q.bind(format!("%{}%", escape_like(term)));
        }
        let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(MemoryRow::into_entry).collect())
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    description: String,
    status: String,
    result: Option<String>,
    created_at: i64,
    updated_at: i64,
    lease_expires_at: Option<i64>,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: Id::from_string(self.id),
            title: self.title,
            description: self.description,
            status: TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Failed),
            result: self.result,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
            lease_expires_at: self.lease_expires_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    task_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> TaskEvent {
        TaskEvent {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            event_type: self.event_type,
            timestamp: millis_to_datetime(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: String,
    role: String,
    content: String,
    created_at: i64,
}

impl MemoryRow {
    fn into_entry(self) -> MemoryEntry {
        MemoryEntry {
            id: Id::from_string(self.id),
            role: self.role,
            content: self.content,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alphred_core::events::TaskCreatedPayload;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) struct TestStorage {
        pub(crate) storage: Arc<Storage>,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    pub(crate) async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage {
            storage: Arc::new(storage),
            _dir: dir,
        }
    }

    /// A pending task created `age_secs` seconds ago.
    pub(crate) fn pending_task(title: &str, age_secs: i64) -> Task {
        let mut task = Task::new(title, format!("{title} details"));
        task.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        task.updated_at = task.created_at;
        task
    }

    #[tokio::test]
    async fn insert_and_get_task() {
        let ts = create_test_storage().await;
        let task = pending_task("t1", 0);

        ts.storage.insert_task(&task).await.unwrap();
        let retrieved = ts.storage.get_task(&task.id).await.unwrap();

        assert_eq!(retrieved.id, task.id);
        assert_eq!(retrieved.title, "t1");
        assert_eq!(retrieved.status, TaskStatus::Pending);
        assert!(retrieved.result.is_none());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_task(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        ts.storage.insert_task(&pending_task("t", 0)).await.unwrap();
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_first() {
        let ts = create_test_storage().await;
        let newer = pending_task("newer", 10);
        let older = pending_task("older", 60);
        ts.storage.insert_task(&newer).await.unwrap();
        ts.storage.insert_task(&older).await.unwrap();

        let claimed = ts
            .storage
            .claim_next_task(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert!(claimed.lease_expires_at.is_some());

        let next = ts
            .storage
            .claim_next_task(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, newer.id);

        let none = ts.storage.claim_next_task(Duration::from_secs(60)).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let ts = create_test_storage().await;
        ts.storage.insert_task(&pending_task("only", 5)).await.unwrap();

        let a = Arc::clone(&ts.storage);
        let b = Arc::clone(&ts.storage);
        let (ra, rb) = tokio::join!(
            a.claim_next_task(Duration::from_secs(60)),
            b.claim_next_task(Duration::from_secs(60)),
        );

        let claimed = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn finish_is_forward_only() {
        let ts = create_test_storage().await;
        let task = pending_task("t", 0);
        ts.storage.insert_task(&task).await.unwrap();

        // PENDING cannot jump straight to a terminal state.
        assert!(!ts
            .storage
            .finish_task(&task.id, TaskStatus::Completed, "early")
            .await
            .unwrap());

        ts.storage.claim_next_task(Duration::from_secs(60)).await.unwrap();
        assert!(ts
            .storage
            .finish_task(&task.id, TaskStatus::Completed, "Done.")
            .await
            .unwrap());

        // Terminal states are final.
        assert!(!ts
            .storage
            .finish_task(&task.id, TaskStatus::Failed, "late")
            .await
            .unwrap());

        let stored = ts.storage.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("Done."));
    }

    #[tokio::test]
    async fn finish_rejects_non_terminal_status() {
        let ts = create_test_storage().await;
        let result = ts
            .storage
            .finish_task(&Id::new(), TaskStatus::Pending, "x")
            .await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidTerminalStatus("PENDING"))
        ));

        let task = pending_task("t", 0);
        ts.storage.insert_task(&task).await.unwrap();
        ts.storage.claim_next_task(Duration::from_secs(60)).await.unwrap();
        let result = ts
            .storage
            .finish_task(&task.id, TaskStatus::InProgress, "x")
            .await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidTerminalStatus("IN_PROGRESS"))
        ));
        let stored = ts.storage.get_task(&task.id).await.unwrap();
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn renew_lease_requires_in_progress() {
        let ts = create_test_storage().await;
        let task = pending_task("t", 0);
        ts.storage.insert_task(&task).await.unwrap();

        let err = ts
            .storage
            .renew_lease(&task.id, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotInProgress(_)));

        let claimed = ts
            .storage
            .claim_next_task(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        ts.storage
            .renew_lease(&task.id, Duration::from_secs(600))
            .await
            .unwrap();
        let renewed = ts.storage.get_task(&task.id).await.unwrap();
        assert!(renewed.lease_expires_at > claimed.lease_expires_at);
    }

    #[tokio::test]
    async fn reclaim_fails_only_expired_leases() {
        let ts = create_test_storage().await;
        let stale = pending_task("stale", 20);
        let fresh = pending_task("fresh", 10);
        ts.storage.insert_task(&stale).await.unwrap();
        ts.storage.insert_task(&fresh).await.unwrap();

        ts.storage.claim_next_task(Duration::from_secs(1)).await.unwrap();
        ts.storage.claim_next_task(Duration::from_secs(3600)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let reclaimed = ts.storage.reclaim_stale_tasks(later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale.id);
        assert_eq!(reclaimed[0].status, TaskStatus::Failed);
        assert_eq!(reclaimed[0].result.as_deref(), Some(LEASE_EXPIRED_RESULT));

        let fresh = ts.storage.get_task(&fresh.id).await.unwrap();
        assert_eq!(fresh.status, TaskStatus::InProgress);

        // Reclaimed tasks are terminal and never claimed again.
        assert!(ts
            .storage
            .claim_next_task(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_tasks_filters_and_limits() {
        let ts = create_test_storage().await;
        for i in 0..4 {
            ts.storage
                .insert_task(&pending_task(&format!("t{i}"), 100 - i))
                .await
                .unwrap();
        }
        ts.storage.claim_next_task(Duration::from_secs(60)).await.unwrap();

        let all = ts.storage.list_tasks(None, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].title, "t3", "newest first");

        let limited = ts.storage.list_tasks(None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let running = ts
            .storage
            .list_tasks(Some(TaskStatus::InProgress), 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].title, "t0");
    }

    #[tokio::test]
    async fn append_and_list_events() {
        let ts = create_test_storage().await;
        let task = pending_task("t", 0);
        ts.storage.insert_task(&task).await.unwrap();

        let payload = EventPayload::TaskCreated(TaskCreatedPayload {
            title: "t".to_string(),
        });
        let event = ts.storage.append_event(&task.id, &payload).await.unwrap();
        assert_eq!(event.event_type, "TASK_CREATED");

        let events = ts.storage.list_events(&task.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].payload_json.contains("\"title\":\"t\""));
    }

    #[tokio::test]
    async fn memories_recent_and_search() {
        let ts = create_test_storage().await;
        ts.storage.insert_memory("User", "my dentist is on Friday").await.unwrap();
        ts.storage.insert_memory("AI", "Noted the dentist appointment.").await.unwrap();
        ts.storage.insert_memory("User", "100% sure about the_plan").await.unwrap();

        let recent = ts.storage.recent_memories(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, "100% sure about the_plan", "oldest first");

        let hits = ts
            .storage
            .search_memories(&["DENTIST".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        // LIKE wildcards in terms are literal.
        let hits = ts.storage.search_memories(&["0%".to_string()], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let none = ts.storage.search_memories(&[], 5).await.unwrap();
        assert!(none.is_empty());
    }
}
