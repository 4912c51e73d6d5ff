//! Task persistence.
//!
//! Every mutation bumps the task's `version` column and is guarded by a
//! `WHERE version = ?` predicate; a stale write surfaces as
//! [`StoreError::VersionConflict`] rather than silently overwriting a
//! concurrent change.

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    from_unix, from_unix_opt, CheckpointFrequency, NewTask, PrivacyLevel, Task, TaskStatus,
    TaskType,
};

const TASK_COLUMNS: &str = "id, description, task_type, status, progress, priority, \
     checkpoint_frequency, privacy_level, tool_preferences, metadata, version, \
     created_at, updated_at, started_at, completed_at";

/// CRUD operations on tasks.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new task in `pending` state and return the stored record.
    #[instrument(skip(self, new))]
    pub async fn create(&self, new: NewTask) -> StoreResult<Task> {
        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let tool_preferences = serde_json::to_string(&new.tool_preferences)?;
        let metadata = serde_json::to_string(&new.metadata)?;

        let task = Task {
            id,
            description: new.description.clone(),
            task_type: new.task_type,
            status: TaskStatus::Pending,
            progress: 0,
            priority: new.priority,
            checkpoint_frequency: new.checkpoint_frequency,
            privacy_level: new.privacy_level,
            tool_preferences: new.tool_preferences,
            metadata: new.metadata,
            version: 1,
            created_at: from_unix(now),
            updated_at: from_unix(now),
            started_at: None,
            completed_at: None,
        };

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, description, task_type, status, progress, priority, \
                     checkpoint_frequency, privacy_level, tool_preferences, metadata, version, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
                    rusqlite::params![
                        id.to_string(),
                        new.description,
                        new.task_type.as_str(),
                        new.priority,
                        new.checkpoint_frequency.as_str(),
                        new.privacy_level.as_str(),
                        tool_preferences,
                        metadata,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(task_id = %task.id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    /// Fetch a task by id, `None` when missing.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    TaskRow::from_row,
                );
                match result {
                    Ok(row) => row.into_task().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// List tasks, optionally filtered by status, newest first, with the
    /// unfiltered total for pagination.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<Task>, i64)> {
        self.db
            .execute(move |conn| {
                let (tasks, total) = match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                        ))?;
                        let rows = stmt
                            .query_map(
                                rusqlite::params![status.as_str(), limit, offset],
                                TaskRow::from_row,
                            )?
                            .collect::<Result<Vec<_>, _>>()?;
                        let total: i64 = conn.query_row(
                            "SELECT count(*) FROM tasks WHERE status = ?1",
                            rusqlite::params![status.as_str()],
                            |row| row.get(0),
                        )?;
                        (rows, total)
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks \
                             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![limit, offset], TaskRow::from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        let total: i64 =
                            conn.query_row("SELECT count(*) FROM tasks", [], |row| row.get(0))?;
                        (rows, total)
                    }
                };

                let tasks = tasks
                    .into_iter()
                    .map(TaskRow::into_task)
                    .collect::<StoreResult<Vec<_>>>()?;
                Ok((tasks, total))
            })
            .await
    }

    /// Tasks the scheduler should visit, ordered by priority then age.
    #[instrument(skip(self))]
    pub async fn active_tasks(&self) -> StoreResult<Vec<Task>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status IN ('initializing', 'in_progress', 'checkpoint') \
                     ORDER BY priority DESC, created_at ASC"
                ))?;
                let rows = stmt
                    .query_map([], TaskRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
            .await
    }

    /// Transition a task's status.
    ///
    /// The current status must be one of `from`; `expected_version`, when
    /// supplied, enforces optimistic concurrency against the caller's
    /// snapshot. Sets `started_at` on the first transition into
    /// `in_progress` and `completed_at` on terminal transitions.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        expected_version: Option<i64>,
    ) -> StoreResult<Task> {
        let id_str = id.to_string();
        let from: Vec<&'static str> = from.iter().map(TaskStatus::as_str).collect();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT status, version FROM tasks WHERE id = ?1",
                        rusqlite::params![id_str],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "task",
                            id: id_str.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let (current, version) = row;

                if let Some(expected) = expected_version {
                    if expected != version {
                        return Err(StoreError::VersionConflict {
                            entity: "task",
                            id: id_str,
                            expected,
                        });
                    }
                }
                if !from.contains(&current.as_str()) {
                    return Err(StoreError::InvalidState {
                        entity: "task",
                        reason: format!("cannot move task from {current} to {to}"),
                    });
                }

                let updated = conn.execute(
                    "UPDATE tasks SET status = ?2, version = version + 1, updated_at = ?3, \
                     started_at = CASE WHEN ?2 = 'in_progress' AND started_at IS NULL \
                         THEN ?3 ELSE started_at END, \
                     completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled') \
                         THEN ?3 ELSE completed_at END \
                     WHERE id = ?1 AND version = ?4",
                    rusqlite::params![id_str, to.as_str(), now, version],
                )?;
                if updated == 0 {
                    return Err(StoreError::VersionConflict {
                        entity: "task",
                        id: id_str,
                        expected: version,
                    });
                }

                conn.query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    rusqlite::params![id_str],
                    TaskRow::from_row,
                )?
                .into_task()
            })
            .await
    }

    /// Store a freshly computed progress percentage.
    #[instrument(skip(self))]
    pub async fn set_progress(&self, id: Uuid, progress: i32) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        let progress = progress.clamp(0, 100);

        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET progress = ?2, version = version + 1, updated_at = ?3 \
                     WHERE id = ?1",
                    rusqlite::params![id, progress, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound { entity: "task", id });
                }
                Ok(())
            })
            .await
    }

    /// Task counts per status, for gauge refresh.
    pub async fn count_by_status(&self) -> StoreResult<Vec<(TaskStatus, i64)>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, count(*) FROM tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(status, count)| Ok((TaskStatus::parse(&status)?, count)))
                    .collect()
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

/// Raw row before JSON and enum decoding; keeps the `rusqlite` mapping
/// closure infallible, with fallible conversion in a second step.
struct TaskRow {
    id: String,
    description: String,
    task_type: String,
    status: String,
    progress: i32,
    priority: i32,
    checkpoint_frequency: String,
    privacy_level: String,
    tool_preferences: String,
    metadata: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            description: row.get(1)?,
            task_type: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            priority: row.get(5)?,
            checkpoint_frequency: row.get(6)?,
            privacy_level: row.get(7)?,
            tool_preferences: row.get(8)?,
            metadata: row.get(9)?,
            version: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        Ok(Task {
            id: Uuid::parse_str(&self.id)
                .map_err(|_| StoreError::InvalidArgument(format!("bad task id {}", self.id)))?,
            description: self.description,
            task_type: TaskType::parse(&self.task_type)?,
            status: TaskStatus::parse(&self.status)?,
            progress: self.progress,
            priority: self.priority,
            checkpoint_frequency: CheckpointFrequency::parse(&self.checkpoint_frequency)?,
            privacy_level: PrivacyLevel::parse(&self.privacy_level)?,
            tool_preferences: serde_json::from_str(&self.tool_preferences)?,
            metadata: serde_json::from_str(&self.metadata)?,
            version: self.version,
            created_at: from_unix(self.created_at),
            updated_at: from_unix(self.updated_at),
            started_at: from_unix_opt(self.started_at),
            completed_at: from_unix_opt(self.completed_at),
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        TaskStore::new(db)
    }

    fn sample() -> NewTask {
        NewTask {
            description: "Add fibonacci endpoint to the calculator service".into(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        let loaded = store.get(task.id).await.unwrap().expect("task exists");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.progress, 0);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = store().await;
        assert!(store.get(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_transition_bumps_version() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        let updated = store
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Initializing);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        let err = store
            .update_status(
                task.id,
                &[TaskStatus::InProgress],
                TaskStatus::Completed,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        store
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await
            .unwrap();

        // Reuse the version from before the first write.
        let err = store
            .update_status(
                task.id,
                &[TaskStatus::Initializing],
                TaskStatus::InProgress,
                Some(task.version),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn started_at_set_once() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        let t = store
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::InProgress,
                None,
            )
            .await
            .unwrap();
        let first_start = t.started_at.expect("started_at set");

        let t = store
            .update_status(
                task.id,
                &[TaskStatus::InProgress],
                TaskStatus::Checkpoint,
                None,
            )
            .await
            .unwrap();
        let t = store
            .update_status(
                t.id,
                &[TaskStatus::Checkpoint],
                TaskStatus::InProgress,
                None,
            )
            .await
            .unwrap();
        assert_eq!(t.started_at, Some(first_start));
    }

    #[tokio::test]
    async fn list_filters_and_counts() {
        let store = store().await;
        for _ in 0..3 {
            store.create(sample()).await.unwrap();
        }
        let task = store.create(sample()).await.unwrap();
        store
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await
            .unwrap();

        let (all, total) = store.list(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(total, 4);

        let (pending, total) = store.list(Some(TaskStatus::Pending), 10, 0).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(total, 3);

        let (page, total) = store.list(None, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn active_tasks_ordered_by_priority() {
        let store = store().await;
        let low = store
            .create(NewTask {
                description: "low priority work".into(),
                priority: 1,
                ..NewTask::default()
            })
            .await
            .unwrap();
        let high = store
            .create(NewTask {
                description: "high priority work".into(),
                priority: 10,
                ..NewTask::default()
            })
            .await
            .unwrap();

        for id in [low.id, high.id] {
            store
                .update_status(id, &[TaskStatus::Pending], TaskStatus::Initializing, None)
                .await
                .unwrap();
        }

        let active = store.active_tasks().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, high.id);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let store = store().await;
        let task = store.create(sample()).await.unwrap();

        store.set_progress(task.id, 250).await.unwrap();
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 100);
    }
}
