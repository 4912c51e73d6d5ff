//! Checkpoint, correction, and rollback persistence.
//!
//! A checkpoint freezes the set of subtasks completed at the moment it
//! was taken. Rollback uses that frozen set, not timestamps, to decide
//! what to undo, which is what makes applying the same rollback twice a
//! no-op.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    from_unix, from_unix_opt, Checkpoint, CheckpointStatus, Correction, CorrectionResult,
    TriggerReason, UserDecision,
};

const CHECKPOINT_COLUMNS: &str = "id, task_id, trigger_reason, status, subtasks_completed, \
     user_decision, user_feedback, version, created_at, updated_at, resolved_at";

/// What a rollback would change, and what it did change.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub checkpoint_id: Uuid,
    pub task_id: Uuid,
    /// Completed subtasks outside the checkpoint's frozen set.
    pub subtasks_reset: Vec<Uuid>,
    /// Checkpoints created after the target.
    pub checkpoints_deleted: Vec<Uuid>,
    pub evaluations_deleted: i64,
    /// Task progress after (or as if after) the rollback.
    pub new_progress: i32,
}

/// Checkpoint lifecycle operations.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a checkpoint in `pending_review` covering the given
    /// completed-subtask set.
    #[instrument(skip(self, subtasks_completed))]
    pub async fn create(
        &self,
        task_id: Uuid,
        trigger_reason: TriggerReason,
        subtasks_completed: Vec<Uuid>,
    ) -> StoreResult<Checkpoint> {
        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let covered = serde_json::to_string(
            &subtasks_completed
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>(),
        )?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints (id, task_id, trigger_reason, status, \
                     subtasks_completed, version, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'pending_review', ?4, 1, ?5, ?5)",
                    rusqlite::params![
                        id.to_string(),
                        task_id.to_string(),
                        trigger_reason.as_str(),
                        covered,
                        now
                    ],
                )?;
                conn.execute(
                    "INSERT INTO activity_logs (entity, entity_id, action, detail, created_at) \
                     VALUES ('checkpoint', ?1, 'created', ?2, ?3)",
                    rusqlite::params![id.to_string(), trigger_reason.as_str(), now],
                )?;
                Ok(())
            })
            .await?;

        info!(checkpoint_id = %id, task_id = %task_id, reason = %trigger_reason, "checkpoint created");
        self.get(id).await?.ok_or(StoreError::NotFound {
            entity: "checkpoint",
            id: id.to_string(),
        })
    }

    /// Fetch a checkpoint by id, `None` when missing.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Checkpoint>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                    rusqlite::params![id],
                    CheckpointRow::from_row,
                );
                match result {
                    Ok(row) => row.into_checkpoint().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Checkpoints of a task, newest first.
    #[instrument(skip(self))]
    pub async fn list_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Checkpoint>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE task_id = ?1 \
                     ORDER BY created_at DESC, id DESC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id], CheckpointRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
            })
            .await
    }

    /// The most recent unresolved checkpoint of a task, if any.
    pub async fn pending_for_task(&self, task_id: Uuid) -> StoreResult<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints \
                         WHERE task_id = ?1 AND status = 'pending_review' \
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    rusqlite::params![task_id],
                    CheckpointRow::from_row,
                );
                match result {
                    Ok(row) => row.into_checkpoint().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Record the human decision on a pending checkpoint.
    #[instrument(skip(self, feedback))]
    pub async fn decide(
        &self,
        id: Uuid,
        decision: UserDecision,
        feedback: Option<String>,
    ) -> StoreResult<Checkpoint> {
        let id_str = id.to_string();
        let now = Utc::now().timestamp();
        let new_status = match decision {
            UserDecision::Accept => CheckpointStatus::Approved,
            UserDecision::Correct => CheckpointStatus::Corrected,
            UserDecision::Reject => CheckpointStatus::Rejected,
        };

        self.db
            .execute(move |conn| {
                let current: String = conn
                    .query_row(
                        "SELECT status FROM checkpoints WHERE id = ?1",
                        rusqlite::params![id_str],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "checkpoint",
                            id: id_str.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                if current != "pending_review" {
                    return Err(StoreError::InvalidState {
                        entity: "checkpoint",
                        reason: format!("checkpoint already resolved ({current})"),
                    });
                }

                conn.execute(
                    "UPDATE checkpoints SET status = ?2, user_decision = ?3, \
                     user_feedback = ?4, resolved_at = ?5, version = version + 1, \
                     updated_at = ?5 WHERE id = ?1",
                    rusqlite::params![
                        id_str,
                        new_status.as_str(),
                        decision.as_str(),
                        feedback,
                        now
                    ],
                )?;
                conn.execute(
                    "INSERT INTO activity_logs (entity, entity_id, action, detail, created_at) \
                     VALUES ('checkpoint', ?1, 'decision', ?2, ?3)",
                    rusqlite::params![id_str, decision.as_str(), now],
                )?;

                conn.query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                    rusqlite::params![id_str],
                    CheckpointRow::from_row,
                )?
                .into_checkpoint()
            })
            .await
    }

    /// Link a correction subtask to a checkpoint.
    #[instrument(skip(self, description))]
    pub async fn add_correction(
        &self,
        checkpoint_id: Uuid,
        subtask_id: Uuid,
        correction_type: &str,
        description: &str,
    ) -> StoreResult<Correction> {
        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let correction_type = correction_type.to_string();
        let description = description.to_string();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO corrections (id, checkpoint_id, subtask_id, correction_type, \
                     description, result, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                    rusqlite::params![
                        id.to_string(),
                        checkpoint_id.to_string(),
                        subtask_id.to_string(),
                        correction_type,
                        description,
                        now
                    ],
                )?;
                Ok(Correction {
                    id,
                    checkpoint_id,
                    subtask_id,
                    correction_type,
                    description,
                    result: CorrectionResult::Pending,
                    created_at: from_unix(now),
                    updated_at: from_unix(now),
                })
            })
            .await
    }

    /// Number of corrections ever raised against a subtask: the
    /// correction-cycle counter.
    pub async fn correction_cycles(&self, subtask_id: Uuid) -> StoreResult<i64> {
        let subtask_id = subtask_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM corrections WHERE subtask_id = ?1",
                    rusqlite::params![subtask_id],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// Unresolved corrections across all checkpoints of a task.
    pub async fn pending_corrections_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Correction>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.checkpoint_id, c.subtask_id, c.correction_type, \
                     c.description, c.result, c.created_at, c.updated_at \
                     FROM corrections c \
                     JOIN checkpoints cp ON cp.id = c.checkpoint_id \
                     WHERE cp.task_id = ?1 AND c.result = 'pending' \
                     ORDER BY c.created_at ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|r| {
                        let parse = |s: &str| {
                            Uuid::parse_str(s).map_err(|_| {
                                StoreError::InvalidArgument(format!("bad id {s}"))
                            })
                        };
                        Ok(Correction {
                            id: parse(&r.0)?,
                            checkpoint_id: parse(&r.1)?,
                            subtask_id: parse(&r.2)?,
                            correction_type: r.3,
                            description: r.4,
                            result: CorrectionResult::parse(&r.5)?,
                            created_at: from_unix(r.6),
                            updated_at: from_unix(r.7),
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Record the outcome of an applied correction.
    #[instrument(skip(self))]
    pub async fn set_correction_result(
        &self,
        id: Uuid,
        result: CorrectionResult,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE corrections SET result = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, result.as_str(), now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "correction",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Compute what a rollback to `checkpoint_id` would change, without
    /// touching anything.
    #[instrument(skip(self))]
    pub async fn rollback_preview(&self, checkpoint_id: Uuid) -> StoreResult<RollbackReport> {
        self.rollback_inner(checkpoint_id, false, false).await
    }

    /// Execute the rollback in one transaction.
    ///
    /// Completed subtasks outside the checkpoint's frozen set go back to
    /// `pending` with output/error cleared; later checkpoints are
    /// deleted; the task's progress is recomputed. Idempotent.
    #[instrument(skip(self))]
    pub async fn rollback_execute(
        &self,
        checkpoint_id: Uuid,
        delete_evaluations: bool,
    ) -> StoreResult<RollbackReport> {
        let report = self
            .rollback_inner(checkpoint_id, true, delete_evaluations)
            .await?;
        info!(
            checkpoint_id = %checkpoint_id,
            subtasks_reset = report.subtasks_reset.len(),
            checkpoints_deleted = report.checkpoints_deleted.len(),
            "rollback executed"
        );
        Ok(report)
    }

    async fn rollback_inner(
        &self,
        checkpoint_id: Uuid,
        apply: bool,
        delete_evaluations: bool,
    ) -> StoreResult<RollbackReport> {
        let cp_id = checkpoint_id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let (task_id, covered_json, cp_created): (String, String, i64) = tx
                    .query_row(
                        "SELECT task_id, subtasks_completed, created_at \
                         FROM checkpoints WHERE id = ?1",
                        rusqlite::params![cp_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "checkpoint",
                            id: cp_id.clone(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;
                let covered: Vec<String> = serde_json::from_str(&covered_json)?;

                // Completed subtasks not frozen by this checkpoint.
                let mut stmt = tx.prepare(
                    "SELECT id FROM subtasks WHERE task_id = ?1 AND status = 'completed'",
                )?;
                let completed: Vec<String> = stmt
                    .query_map(rusqlite::params![task_id], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                drop(stmt);
                let to_reset: Vec<String> = completed
                    .into_iter()
                    .filter(|id| !covered.contains(id))
                    .collect();

                // Checkpoints created after the target. The UUIDv7 id
                // breaks ties within the same second.
                let mut stmt = tx.prepare(
                    "SELECT id FROM checkpoints WHERE task_id = ?1 \
                     AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))",
                )?;
                let later: Vec<String> = stmt
                    .query_map(rusqlite::params![task_id, cp_created, cp_id], |row| {
                        row.get(0)
                    })?
                    .collect::<Result<_, _>>()?;
                drop(stmt);

                let mut evaluations_deleted = 0_i64;
                if apply {
                    for id in &to_reset {
                        tx.execute(
                            "UPDATE subtasks SET status = 'pending', progress = 0, \
                             output = NULL, error = NULL, assigned_worker = NULL, \
                             assigned_tool = NULL, started_at = NULL, completed_at = NULL, \
                             version = version + 1, updated_at = ?2 WHERE id = ?1",
                            rusqlite::params![id, now],
                        )?;
                        if delete_evaluations {
                            evaluations_deleted += tx.execute(
                                "DELETE FROM evaluations WHERE subtask_id = ?1",
                                rusqlite::params![id],
                            )? as i64;
                        }
                    }
                    for id in &later {
                        tx.execute(
                            "DELETE FROM checkpoints WHERE id = ?1",
                            rusqlite::params![id],
                        )?;
                    }
                } else if delete_evaluations {
                    for id in &to_reset {
                        evaluations_deleted += tx.query_row(
                            "SELECT count(*) FROM evaluations WHERE subtask_id = ?1",
                            rusqlite::params![id],
                            |row| row.get::<_, i64>(0),
                        )?;
                    }
                }

                // Progress after the reset.
                let (total, completed_after): (i64, i64) = tx.query_row(
                    "SELECT count(*), count(*) FILTER (WHERE status = 'completed') \
                     FROM subtasks WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let remaining_completed = if apply {
                    completed_after
                } else {
                    completed_after - to_reset.len() as i64
                };
                let new_progress = if total > 0 {
                    ((remaining_completed.max(0) * 100) / total) as i32
                } else {
                    0
                };

                if apply {
                    tx.execute(
                        "UPDATE tasks SET progress = ?2, version = version + 1, updated_at = ?3 \
                         WHERE id = ?1",
                        rusqlite::params![task_id, new_progress, now],
                    )?;
                    tx.execute(
                        "INSERT INTO activity_logs (entity, entity_id, action, detail, created_at) \
                         VALUES ('checkpoint', ?1, 'rollback', ?2, ?3)",
                        rusqlite::params![cp_id, format!("reset {} subtasks", to_reset.len()), now],
                    )?;
                }

                tx.commit()?;

                let parse = |s: &String| {
                    Uuid::parse_str(s)
                        .map_err(|_| StoreError::InvalidArgument(format!("bad id {s}")))
                };
                Ok(RollbackReport {
                    checkpoint_id,
                    task_id: Uuid::parse_str(&task_id).map_err(|_| {
                        StoreError::InvalidArgument(format!("bad task id {task_id}"))
                    })?,
                    subtasks_reset: to_reset.iter().map(parse).collect::<StoreResult<_>>()?,
                    checkpoints_deleted: later.iter().map(parse).collect::<StoreResult<_>>()?,
                    evaluations_deleted,
                    new_progress,
                })
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

struct CheckpointRow {
    id: String,
    task_id: String,
    trigger_reason: String,
    status: String,
    subtasks_completed: String,
    user_decision: Option<String>,
    user_feedback: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
    resolved_at: Option<i64>,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            trigger_reason: row.get(2)?,
            status: row.get(3)?,
            subtasks_completed: row.get(4)?,
            user_decision: row.get(5)?,
            user_feedback: row.get(6)?,
            version: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            resolved_at: row.get(10)?,
        })
    }

    fn into_checkpoint(self) -> StoreResult<Checkpoint> {
        let covered: Vec<String> = serde_json::from_str(&self.subtasks_completed)?;
        let subtasks_completed = covered
            .iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| StoreError::InvalidArgument(format!("bad subtask id {s}")))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Checkpoint {
            id: Uuid::parse_str(&self.id).map_err(|_| {
                StoreError::InvalidArgument(format!("bad checkpoint id {}", self.id))
            })?,
            task_id: Uuid::parse_str(&self.task_id)
                .map_err(|_| StoreError::InvalidArgument(format!("bad task id {}", self.task_id)))?,
            trigger_reason: TriggerReason::parse(&self.trigger_reason)?,
            status: CheckpointStatus::parse(&self.status)?,
            subtasks_completed,
            user_decision: self
                .user_decision
                .as_deref()
                .map(UserDecision::parse)
                .transpose()?,
            user_feedback: self.user_feedback,
            version: self.version,
            created_at: from_unix(self.created_at),
            updated_at: from_unix(self.updated_at),
            resolved_at: from_unix_opt(self.resolved_at),
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
