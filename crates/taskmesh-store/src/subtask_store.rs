//! Subtask persistence, including the atomic allocation bind.
//!
//! The binding fields (`status`, `assigned_worker`) have a single
//! writer: [`SubtaskStore::bind`] and [`SubtaskStore::release`], both of
//! which run their re-checks and writes inside one SQLite transaction.
//! SQLite's single-writer lock plays the role a `SELECT … FOR UPDATE`
//! row lock would on a server database.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    from_unix, from_unix_opt, NewSubtask, Subtask, SubtaskStatus, SubtaskType, WorkerStatus,
};

const SUBTASK_COLUMNS: &str = "id, task_id, name, description, subtask_type, status, progress, \
     dependencies, recommended_tool, assigned_worker, assigned_tool, complexity, priority, \
     output, error, version, created_at, updated_at, started_at, completed_at";

/// How a worker reported a subtask finishing.
#[derive(Debug, Clone)]
pub enum SubtaskOutcome {
    Completed { output: serde_json::Value },
    Failed { error: String },
}

/// Aggregate view of a task's subtasks used for progress recomputation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub terminal: i64,
}

impl TaskProgress {
    /// `floor(100 * completed / total)`, 0 for an empty set.
    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed * 100) / self.total) as i32
    }

    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.terminal == self.total
    }
}

/// Result of releasing a subtask binding.
#[derive(Debug, Clone)]
pub struct ReleaseResult {
    pub subtask: Subtask,
    pub worker_id: Option<Uuid>,
    /// True when the worker has no other in-progress subtasks and was
    /// flipped back to idle.
    pub worker_idle: bool,
}

/// CRUD and allocation operations on subtasks.
#[derive(Clone)]
pub struct SubtaskStore {
    db: Database,
}

impl SubtaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a decomposed DAG in one transaction: all rows or none.
    #[instrument(skip(self, subtasks), fields(count = subtasks.len()))]
    pub async fn create_batch(&self, subtasks: Vec<NewSubtask>) -> StoreResult<Vec<Subtask>> {
        let now = Utc::now().timestamp();
        let ids: Vec<Uuid> = subtasks.iter().map(|s| s.id).collect();
        let task_id = subtasks.first().map(|s| s.task_id);

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                for s in &subtasks {
                    let deps = serde_json::to_string(
                        &s.dependencies.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                    )?;
                    tx.execute(
                        "INSERT INTO subtasks (id, task_id, name, description, subtask_type, \
                         status, progress, dependencies, recommended_tool, complexity, priority, \
                         version, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
                        rusqlite::params![
                            s.id.to_string(),
                            s.task_id.to_string(),
                            s.name,
                            s.description,
                            s.subtask_type.as_str(),
                            deps,
                            s.recommended_tool,
                            s.complexity,
                            s.priority,
                            now
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(task_id = ?task_id, count = ids.len(), "subtask batch inserted");

        // Read back in insertion order.
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(subtask) = self.get(id).await? {
                out.push(subtask);
            }
        }
        Ok(out)
    }

    /// Fetch a subtask by id, `None` when missing.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Subtask>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                    rusqlite::params![id],
                    SubtaskRow::from_row,
                );
                match result {
                    Ok(row) => row.into_subtask().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All subtasks of a task in insertion order.
    #[instrument(skip(self))]
    pub async fn list_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Subtask>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 \
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id], SubtaskRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(SubtaskRow::into_subtask).collect()
            })
            .await
    }

    /// Whether a task has any subtasks at all (idempotency guard for
    /// decomposition).
    pub async fn task_has_subtasks(&self, task_id: Uuid) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM subtasks WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Pending subtasks of a task whose dependencies are all completed.
    ///
    /// Two queries (the pending rows, then the completed id set) and a
    /// subset filter; no per-subtask round trips. Ordered by priority
    /// descending, then insertion order.
    #[instrument(skip(self))]
    pub async fn ready_subtasks(&self, task_id: Uuid) -> StoreResult<Vec<Subtask>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks \
                     WHERE task_id = ?1 AND status = 'pending' \
                     ORDER BY priority DESC, created_at ASC, id ASC"
                ))?;
                let pending = stmt
                    .query_map(rusqlite::params![task_id], SubtaskRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT id FROM subtasks WHERE task_id = ?1 AND status = 'completed'",
                )?;
                let completed: HashSet<String> = stmt
                    .query_map(rusqlite::params![task_id], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                pending
                    .into_iter()
                    .map(SubtaskRow::into_subtask)
                    .filter(|s| match s {
                        Ok(s) => s
                            .dependencies
                            .iter()
                            .all(|dep| completed.contains(&dep.to_string())),
                        Err(_) => true,
                    })
                    .collect()
            })
            .await
    }

    /// Atomically bind a subtask to a worker.
    ///
    /// Re-checks every invariant under the write lock: the subtask is
    /// still allocatable, the worker is still eligible and under its
    /// cap, and the global live cap is not exceeded. On success the
    /// subtask becomes `in_progress` and the worker `busy`; both
    /// versions bump.
    #[instrument(skip(self))]
    pub async fn bind(
        &self,
        subtask_id: Uuid,
        worker_id: Uuid,
        tool: Option<String>,
        per_worker_cap: i64,
        global_cap: i64,
    ) -> StoreResult<Subtask> {
        let sid = subtask_id.to_string();
        let wid = worker_id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let (status, version): (String, i64) = tx
                    .query_row(
                        "SELECT status, version FROM subtasks WHERE id = ?1",
                        rusqlite::params![sid],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "subtask",
                            id: sid.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                if status != "pending" && status != "queued" {
                    return Err(StoreError::InvalidState {
                        entity: "subtask",
                        reason: format!("cannot allocate subtask in state {status}"),
                    });
                }

                let worker_status: String = tx
                    .query_row(
                        "SELECT status FROM workers WHERE id = ?1",
                        rusqlite::params![wid],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "worker",
                            id: wid.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let worker_status = WorkerStatus::parse(&worker_status)?;
                if !matches!(
                    worker_status,
                    WorkerStatus::Online | WorkerStatus::Idle | WorkerStatus::Busy
                ) {
                    return Err(StoreError::InvalidState {
                        entity: "worker",
                        reason: format!("worker is {worker_status}"),
                    });
                }

                let worker_load: i64 = tx.query_row(
                    "SELECT count(*) FROM subtasks \
                     WHERE assigned_worker = ?1 AND status = 'in_progress'",
                    rusqlite::params![wid],
                    |row| row.get(0),
                )?;
                if worker_load >= per_worker_cap {
                    return Err(StoreError::InvalidState {
                        entity: "worker",
                        reason: format!("worker at capacity ({worker_load}/{per_worker_cap})"),
                    });
                }

                let live: i64 = tx.query_row(
                    "SELECT count(*) FROM subtasks WHERE status = 'in_progress'",
                    rusqlite::params![],
                    |row| row.get(0),
                )?;
                if live >= global_cap {
                    return Err(StoreError::InvalidState {
                        entity: "subtask",
                        reason: format!("global concurrency cap reached ({live}/{global_cap})"),
                    });
                }

                let updated = tx.execute(
                    "UPDATE subtasks SET status = 'in_progress', assigned_worker = ?2, \
                     assigned_tool = ?3, started_at = ?4, version = version + 1, updated_at = ?4 \
                     WHERE id = ?1 AND version = ?5",
                    rusqlite::params![sid, wid, tool, now, version],
                )?;
                if updated == 0 {
                    return Err(StoreError::VersionConflict {
                        entity: "subtask",
                        id: sid,
                        expected: version,
                    });
                }

                tx.execute(
                    "UPDATE workers SET status = 'busy', version = version + 1, updated_at = ?2 \
                     WHERE id = ?1",
                    rusqlite::params![wid, now],
                )?;

                let subtask = tx
                    .query_row(
                        &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                        rusqlite::params![sid],
                        SubtaskRow::from_row,
                    )?
                    .into_subtask()?;

                tx.commit()?;
                Ok(subtask)
            })
            .await
    }

    /// Record a worker-reported outcome and release the binding.
    ///
    /// Flips the worker back to idle when this was its last in-progress
    /// subtask.
    #[instrument(skip(self, outcome))]
    pub async fn release(
        &self,
        subtask_id: Uuid,
        outcome: SubtaskOutcome,
    ) -> StoreResult<ReleaseResult> {
        let sid = subtask_id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let (status, worker): (String, Option<String>) = tx
                    .query_row(
                        "SELECT status, assigned_worker FROM subtasks WHERE id = ?1",
                        rusqlite::params![sid],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "subtask",
                            id: sid.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                if status != "in_progress" && status != "correcting" {
                    return Err(StoreError::InvalidState {
                        entity: "subtask",
                        reason: format!("cannot release subtask in state {status}"),
                    });
                }

                match &outcome {
                    SubtaskOutcome::Completed { output } => {
                        tx.execute(
                            "UPDATE subtasks SET status = 'completed', progress = 100, \
                             output = ?2, error = NULL, completed_at = ?3, \
                             version = version + 1, updated_at = ?3 WHERE id = ?1",
                            rusqlite::params![sid, serde_json::to_string(output)?, now],
                        )?;
                    }
                    SubtaskOutcome::Failed { error } => {
                        tx.execute(
                            "UPDATE subtasks SET status = 'failed', error = ?2, \
                             completed_at = ?3, version = version + 1, updated_at = ?3 \
                             WHERE id = ?1",
                            rusqlite::params![sid, error, now],
                        )?;
                    }
                }

                let mut worker_idle = false;
                let worker_id = match &worker {
                    Some(wid) => {
                        let remaining: i64 = tx.query_row(
                            "SELECT count(*) FROM subtasks \
                             WHERE assigned_worker = ?1 AND status = 'in_progress'",
                            rusqlite::params![wid],
                            |row| row.get(0),
                        )?;
                        if remaining == 0 {
                            tx.execute(
                                "UPDATE workers SET status = 'idle', version = version + 1, \
                                 updated_at = ?2 WHERE id = ?1 AND status = 'busy'",
                                rusqlite::params![wid, now],
                            )?;
                            worker_idle = true;
                        }
                        Some(Uuid::parse_str(wid).map_err(|_| {
                            StoreError::InvalidArgument(format!("bad worker id {wid}"))
                        })?)
                    }
                    None => None,
                };

                let subtask = tx
                    .query_row(
                        &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                        rusqlite::params![sid],
                        SubtaskRow::from_row,
                    )?
                    .into_subtask()?;

                tx.commit()?;
                Ok(ReleaseResult {
                    subtask,
                    worker_id,
                    worker_idle,
                })
            })
            .await
    }

    /// Move a subtask between non-binding states (`queued`,
    /// `correcting`, back to `pending`).
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        id: Uuid,
        from: &[SubtaskStatus],
        to: SubtaskStatus,
    ) -> StoreResult<Subtask> {
        let id_str = id.to_string();
        let from: Vec<&'static str> = from.iter().map(SubtaskStatus::as_str).collect();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let current: String = conn
                    .query_row(
                        "SELECT status FROM subtasks WHERE id = ?1",
                        rusqlite::params![id_str],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "subtask",
                            id: id_str.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                if !from.contains(&current.as_str()) {
                    return Err(StoreError::InvalidState {
                        entity: "subtask",
                        reason: format!("cannot move subtask from {current} to {to}"),
                    });
                }

                conn.execute(
                    "UPDATE subtasks SET status = ?2, version = version + 1, updated_at = ?3 \
                     WHERE id = ?1",
                    rusqlite::params![id_str, to.as_str(), now],
                )?;

                conn.query_row(
                    &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                    rusqlite::params![id_str],
                    SubtaskRow::from_row,
                )?
                .into_subtask()
            })
            .await
    }

    /// Cancel all non-terminal subtasks of a task; returns the ids that
    /// were live (queued/in-progress) so the caller can clear the cache
    /// queue and in-progress set.
    #[instrument(skip(self))]
    pub async fn cancel_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let task_id = task_id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let mut stmt = tx.prepare(
                    "SELECT id FROM subtasks WHERE task_id = ?1 \
                     AND status IN ('queued', 'in_progress')",
                )?;
                let live: Vec<String> = stmt
                    .query_map(rusqlite::params![task_id], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                drop(stmt);

                tx.execute(
                    "UPDATE subtasks SET status = 'cancelled', version = version + 1, \
                     updated_at = ?2, completed_at = ?2 \
                     WHERE task_id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    rusqlite::params![task_id, now],
                )?;

                // Workers whose only in-progress work was cancelled go
                // back to idle.
                tx.execute(
                    "UPDATE workers SET status = 'idle', version = version + 1, updated_at = ?1 \
                     WHERE status = 'busy' AND id NOT IN \
                     (SELECT assigned_worker FROM subtasks \
                      WHERE status = 'in_progress' AND assigned_worker IS NOT NULL)",
                    rusqlite::params![now],
                )?;

                tx.commit()?;

                live.iter()
                    .map(|id| {
                        Uuid::parse_str(id).map_err(|_| {
                            StoreError::InvalidArgument(format!("bad subtask id {id}"))
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Authoritative count of in-progress subtasks.
    pub async fn in_progress_count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM subtasks WHERE status = 'in_progress'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// In-progress count for a single worker.
    pub async fn worker_load(&self, worker_id: Uuid) -> StoreResult<i64> {
        let worker_id = worker_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM subtasks \
                     WHERE assigned_worker = ?1 AND status = 'in_progress'",
                    rusqlite::params![worker_id],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// Progress aggregates for a task.
    pub async fn task_progress(&self, task_id: Uuid) -> StoreResult<TaskProgress> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let row = conn.query_row(
                    "SELECT count(*), \
                     count(*) FILTER (WHERE status = 'completed'), \
                     count(*) FILTER (WHERE status = 'failed'), \
                     count(*) FILTER (WHERE status IN ('completed', 'failed', 'cancelled')) \
                     FROM subtasks WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| {
                        Ok(TaskProgress {
                            total: row.get(0)?,
                            completed: row.get(1)?,
                            failed: row.get(2)?,
                            terminal: row.get(3)?,
                        })
                    },
                )?;
                Ok(row)
            })
            .await
    }

    /// Subtask counts per status, for gauge refresh.
    pub async fn count_by_status(&self) -> StoreResult<Vec<(SubtaskStatus, i64)>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, count(*) FROM subtasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(status, count)| Ok((SubtaskStatus::parse(&status)?, count)))
                    .collect()
            })
            .await
    }

    /// Subtask counts per assigned tool, for gauge refresh.
    pub async fn count_by_tool(&self) -> StoreResult<Vec<(String, i64)>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT assigned_tool, count(*) FROM subtasks \
                     WHERE assigned_tool IS NOT NULL GROUP BY assigned_tool",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

struct SubtaskRow {
    id: String,
    task_id: String,
    name: String,
    description: String,
    subtask_type: String,
    status: String,
    progress: i32,
    dependencies: String,
    recommended_tool: Option<String>,
    assigned_worker: Option<String>,
    assigned_tool: Option<String>,
    complexity: i32,
    priority: i32,
    output: Option<String>,
    error: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl SubtaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            subtask_type: row.get(4)?,
            status: row.get(5)?,
            progress: row.get(6)?,
            dependencies: row.get(7)?,
            recommended_tool: row.get(8)?,
            assigned_worker: row.get(9)?,
            assigned_tool: row.get(10)?,
            complexity: row.get(11)?,
            priority: row.get(12)?,
            output: row.get(13)?,
            error: row.get(14)?,
            version: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            started_at: row.get(18)?,
            completed_at: row.get(19)?,
        })
    }

    fn into_subtask(self) -> StoreResult<Subtask> {
        let parse_uuid = |s: &str, what: &str| {
            Uuid::parse_str(s)
                .map_err(|_| StoreError::InvalidArgument(format!("bad {what} id {s}")))
        };

        let deps: Vec<String> = serde_json::from_str(&self.dependencies)?;
        let dependencies = deps
            .iter()
            .map(|d| parse_uuid(d, "dependency"))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Subtask {
            id: parse_uuid(&self.id, "subtask")?,
            task_id: parse_uuid(&self.task_id, "task")?,
            name: self.name,
            description: self.description,
            subtask_type: SubtaskType::parse(&self.subtask_type)?,
            status: SubtaskStatus::parse(&self.status)?,
            progress: self.progress,
            dependencies,
            recommended_tool: self.recommended_tool,
            assigned_worker: self
                .assigned_worker
                .as_deref()
                .map(|w| parse_uuid(w, "worker"))
                .transpose()?,
            assigned_tool: self.assigned_tool,
            complexity: self.complexity,
            priority: self.priority,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: self.error,
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
    use crate::task_store::TaskStore;
    use crate::types::{NewTask, WorkerRegistration};
    use crate::worker_store::WorkerStore;

    struct Fixture {
        tasks: TaskStore,
        subtasks: SubtaskStore,
        workers: WorkerStore,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        Fixture {
            tasks: TaskStore::new(db.clone()),
            subtasks: SubtaskStore::new(db.clone()),
            workers: WorkerStore::new(db),
        }
    }

    fn step(task_id: Uuid, name: &str, deps: Vec<Uuid>) -> NewSubtask {
        NewSubtask {
            id: Uuid::now_v7(),
            task_id,
            name: name.into(),
            description: format!("{name} for the sample task"),
            subtask_type: SubtaskType::CodeGeneration,
            dependencies: deps,
            recommended_tool: Some("claude_code".into()),
            complexity: 3,
            priority: 5,
        }
    }

    async fn sample_task(f: &Fixture) -> Uuid {
        f.tasks
            .create(NewTask {
                description: "sample task for subtask tests".into(),
                ..NewTask::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn sample_worker(f: &Fixture) -> Uuid {
        f.workers
            .register(WorkerRegistration {
                machine_id: "machine-1".into(),
                machine_name: "Test Box".into(),
                system_info: Default::default(),
                tools: vec!["claude_code".into()],
                on_prem: false,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn batch_insert_and_list() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Code Review", vec![a.id]);
        let created = f.subtasks.create_batch(vec![a, b]).await.unwrap();
        assert_eq!(created.len(), 2);

        let listed = f.subtasks.list_for_task(task_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "Code Generation");
        assert_eq!(listed[1].dependencies, vec![listed[0].id]);
        assert!(f.subtasks.task_has_subtasks(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn readiness_respects_dependencies() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Code Review", vec![a.id]);
        let a_id = a.id;
        f.subtasks.create_batch(vec![a, b]).await.unwrap();

        let ready = f.subtasks.ready_subtasks(task_id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, a_id);

        // Complete the first; the second becomes ready.
        f.subtasks
            .bind(a_id, worker, Some("claude_code".into()), 1, 20)
            .await
            .unwrap();
        f.subtasks
            .release(
                a_id,
                SubtaskOutcome::Completed {
                    output: serde_json::json!({"files": 1}),
                },
            )
            .await
            .unwrap();

        let ready = f.subtasks.ready_subtasks(task_id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name, "Code Review");
    }

    #[tokio::test]
    async fn bind_sets_fields_and_busies_worker() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let a_id = a.id;
        f.subtasks.create_batch(vec![a]).await.unwrap();

        let bound = f
            .subtasks
            .bind(a_id, worker, Some("claude_code".into()), 1, 20)
            .await
            .unwrap();
        assert_eq!(bound.status, SubtaskStatus::InProgress);
        assert_eq!(bound.assigned_worker, Some(worker));
        assert!(bound.started_at.is_some());
        assert_eq!(bound.version, 2);

        let w = f.workers.get(worker).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn bind_enforces_per_worker_cap() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Analysis", vec![]);
        let (a_id, b_id) = (a.id, b.id);
        f.subtasks.create_batch(vec![a, b]).await.unwrap();

        f.subtasks.bind(a_id, worker, None, 1, 20).await.unwrap();
        let err = f.subtasks.bind(b_id, worker, None, 1, 20).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn bind_enforces_global_cap() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Analysis", vec![]);
        let (a_id, b_id) = (a.id, b.id);
        f.subtasks.create_batch(vec![a, b]).await.unwrap();

        f.subtasks.bind(a_id, worker, None, 5, 1).await.unwrap();
        let err = f.subtasks.bind(b_id, worker, None, 5, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn double_bind_rejected() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let a_id = a.id;
        f.subtasks.create_batch(vec![a]).await.unwrap();

        f.subtasks.bind(a_id, worker, None, 2, 20).await.unwrap();
        let err = f.subtasks.bind(a_id, worker, None, 2, 20).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn release_failure_keeps_error_and_idles_worker() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let a_id = a.id;
        f.subtasks.create_batch(vec![a]).await.unwrap();
        f.subtasks.bind(a_id, worker, None, 1, 20).await.unwrap();

        let released = f
            .subtasks
            .release(
                a_id,
                SubtaskOutcome::Failed {
                    error: "tool crashed".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(released.subtask.status, SubtaskStatus::Failed);
        assert_eq!(released.subtask.error.as_deref(), Some("tool crashed"));
        assert!(released.worker_idle);

        let w = f.workers.get(worker).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn cancel_for_task_returns_live_ids() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Analysis", vec![]);
        let c = step(task_id, "Test", vec![]);
        let (a_id, b_id) = (a.id, b.id);
        f.subtasks.create_batch(vec![a, b, c]).await.unwrap();

        f.subtasks.bind(a_id, worker, None, 2, 20).await.unwrap();
        f.subtasks
            .set_status(b_id, &[SubtaskStatus::Pending], SubtaskStatus::Queued)
            .await
            .unwrap();

        let live = f.subtasks.cancel_for_task(task_id).await.unwrap();
        assert_eq!(live.len(), 2);

        for s in f.subtasks.list_for_task(task_id).await.unwrap() {
            assert_eq!(s.status, SubtaskStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn progress_aggregates() {
        let f = fixture().await;
        let task_id = sample_task(&f).await;
        let worker = sample_worker(&f).await;

        let a = step(task_id, "Code Generation", vec![]);
        let b = step(task_id, "Analysis", vec![]);
        let (a_id, _) = (a.id, b.id);
        f.subtasks.create_batch(vec![a, b]).await.unwrap();

        f.subtasks.bind(a_id, worker, None, 1, 20).await.unwrap();
        f.subtasks
            .release(
                a_id,
                SubtaskOutcome::Completed {
                    output: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        let progress = f.subtasks.task_progress(task_id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.percent(), 50);
        assert!(!progress.all_terminal());
    }
}
