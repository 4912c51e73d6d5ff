//! Checkpoint triggering and human decisions.
//!
//! The trigger is a rule engine consulted after evaluations, subtask
//! errors, subtask completions, and on the scheduler's periodic sweep.
//! Rules fire in severity order (error, low evaluation, cadence,
//! timeout) and each is independently enableable. A task that is
//! terminal or already paused never gains another checkpoint, and at
//! most one checkpoint per task is pending review at a time.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskmesh_kernel::{CacheService, EventBus, EventEnvelope, EventType};
use taskmesh_store::{
    Checkpoint, CheckpointStore, NewSubtask, RollbackReport, Subtask, SubtaskStatus, SubtaskStore,
    SubtaskType, TaskStatus, TaskStore, TriggerReason, UserDecision,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// What the caller observed when it consulted the trigger.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerContext {
    pub error_occurred: bool,
    pub evaluation_score: Option<f64>,
    pub completed_subtask: Option<Uuid>,
}

/// Result of processing a human checkpoint decision.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub checkpoint: Checkpoint,
    pub corrections_created: usize,
    pub fix_subtasks: Vec<Uuid>,
}

/// The rule engine that decides when to halt a task for review.
#[derive(Clone)]
pub struct CheckpointTrigger {
    tasks: TaskStore,
    subtasks: SubtaskStore,
    checkpoints: CheckpointStore,
    cache: CacheService,
    bus: EventBus,
    config: EngineConfig,
}

impl CheckpointTrigger {
    pub fn new(
        tasks: TaskStore,
        subtasks: SubtaskStore,
        checkpoints: CheckpointStore,
        cache: CacheService,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            checkpoints,
            cache,
            bus,
            config,
        }
    }

    /// Evaluate the trigger rules; create a checkpoint and pause the
    /// task when one fires. `Ok(None)` when nothing fires (including a
    /// missing or already-paused task).
    #[instrument(skip(self, ctx))]
    pub async fn check_and_trigger(
        &self,
        task_id: Uuid,
        ctx: TriggerContext,
    ) -> EngineResult<Option<Checkpoint>> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(None);
        };
        if task.status.is_terminal() || task.status == TaskStatus::Checkpoint {
            return Ok(None);
        }
        if self.checkpoints.pending_for_task(task_id).await?.is_some() {
            return Ok(None);
        }

        let reason = if ctx.error_occurred && self.config.enable_error_trigger {
            Some(TriggerReason::ReviewIssuesFound)
        } else if self.config.enable_evaluation_trigger
            && ctx
                .evaluation_score
                .is_some_and(|score| score < self.config.evaluation_threshold)
        {
            Some(TriggerReason::LowEvaluationScore)
        } else if ctx.completed_subtask.is_some() && self.config.enable_periodic_trigger {
            let progress = self.subtasks.task_progress(task_id).await?;
            let interval = self.config.subtask_completion_interval;
            if progress.completed > 0 && progress.completed % interval == 0 {
                Some(TriggerReason::Periodic)
            } else {
                None
            }
        } else if self.config.enable_timeout_trigger
            && task.started_at.is_some_and(|started| {
                (Utc::now() - started).to_std().unwrap_or_default() >= self.config.task_timeout
            })
        {
            Some(TriggerReason::Timeout)
        } else {
            None
        };

        let Some(reason) = reason else {
            return Ok(None);
        };

        let checkpoint = self.create_checkpoint(task_id, reason).await?;
        Ok(Some(checkpoint))
    }

    /// Create a manually requested checkpoint regardless of the rules
    /// (guardrails still apply).
    #[instrument(skip(self))]
    pub async fn trigger_manual(&self, task_id: Uuid) -> EngineResult<Checkpoint> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidState {
                message: format!("cannot checkpoint task in state {}", task.status),
            });
        }
        self.create_checkpoint(task_id, TriggerReason::Manual).await
    }

    /// Whether a subtask has exhausted its correction budget.
    pub async fn is_at_cycle_limit(&self, subtask_id: Uuid) -> EngineResult<bool> {
        let cycles = self.checkpoints.correction_cycles(subtask_id).await?;
        Ok(cycles >= self.config.max_correction_cycles)
    }

    /// Process a human decision on a pending checkpoint.
    #[instrument(skip(self, feedback))]
    pub async fn decide(
        &self,
        checkpoint_id: Uuid,
        decision: UserDecision,
        feedback: Option<String>,
    ) -> EngineResult<DecisionOutcome> {
        let checkpoint = self
            .checkpoints
            .get(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint", checkpoint_id))?;
        let task_id = checkpoint.task_id;

        let resolved = self
            .checkpoints
            .decide(checkpoint_id, decision, feedback.clone())
            .await?;

        let outcome = match decision {
            UserDecision::Accept => {
                self.resume_task(task_id).await?;
                DecisionOutcome {
                    checkpoint: resolved,
                    corrections_created: 0,
                    fix_subtasks: Vec::new(),
                }
            }
            UserDecision::Reject => {
                self.cancel_task_for_rejection(task_id).await?;
                DecisionOutcome {
                    checkpoint: resolved,
                    corrections_created: 0,
                    fix_subtasks: Vec::new(),
                }
            }
            UserDecision::Correct => {
                let (created, fixes, at_limit) = self
                    .spawn_corrections(&resolved, feedback.as_deref().unwrap_or(""))
                    .await?;
                if created > 0 {
                    self.resume_task(task_id).await?;
                } else if at_limit > 0 {
                    // Every affected subtask exhausted its budget: stop
                    // auto-fixing and demand a fresh manual review.
                    warn!(task_id = %task_id, "correction cycle limit reached; manual checkpoint");
                    self.checkpoints
                        .create(task_id, TriggerReason::Manual, resolved.subtasks_completed.clone())
                        .await?;
                } else {
                    self.resume_task(task_id).await?;
                }
                DecisionOutcome {
                    checkpoint: resolved,
                    corrections_created: created,
                    fix_subtasks: fixes,
                }
            }
        };

        info!(checkpoint_id = %checkpoint_id, decision = %decision, "checkpoint decision processed");
        Ok(outcome)
    }

    /// Settle the correction cycle after a `code_fix` subtask finishes:
    /// restore the correcting originals (completed on success, failed
    /// otherwise) and resolve their pending correction records.
    #[instrument(skip(self))]
    pub async fn apply_fix_result(&self, task_id: Uuid, succeeded: bool) -> EngineResult<()> {
        let restored_to = if succeeded {
            SubtaskStatus::Completed
        } else {
            SubtaskStatus::Failed
        };

        for subtask in self.subtasks.list_for_task(task_id).await? {
            if subtask.status == SubtaskStatus::Correcting {
                self.subtasks
                    .set_status(subtask.id, &[SubtaskStatus::Correcting], restored_to)
                    .await?;
            }
        }

        let result = if succeeded {
            taskmesh_store::CorrectionResult::Applied
        } else {
            taskmesh_store::CorrectionResult::Failed
        };
        for correction in self.checkpoints.pending_corrections_for_task(task_id).await? {
            self.checkpoints
                .set_correction_result(correction.id, result)
                .await?;
        }

        Ok(())
    }

    /// What a rollback to this checkpoint would change.
    pub async fn rollback_preview(&self, checkpoint_id: Uuid) -> EngineResult<RollbackReport> {
        Ok(self.checkpoints.rollback_preview(checkpoint_id).await?)
    }

    /// Execute the rollback and resume the task.
    #[instrument(skip(self))]
    pub async fn rollback(
        &self,
        checkpoint_id: Uuid,
        delete_evaluations: bool,
    ) -> EngineResult<RollbackReport> {
        let checkpoint = self
            .checkpoints
            .get(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint", checkpoint_id))?;
        let task = self
            .tasks
            .get(checkpoint.task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", checkpoint.task_id))?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidState {
                message: format!("cannot roll back task in state {}", task.status),
            });
        }

        let report = self
            .checkpoints
            .rollback_execute(checkpoint_id, delete_evaluations)
            .await?;

        if task.status == TaskStatus::Checkpoint {
            self.resume_task(task.id).await?;
        }
        self.bus
            .publish(
                task.id,
                &EventEnvelope::new(
                    EventType::Status,
                    serde_json::json!({
                        "task_id": task.id,
                        "rollback_to": checkpoint_id,
                        "subtasks_reset": report.subtasks_reset,
                    }),
                ),
            )
            .await?;
        Ok(report)
    }

    async fn create_checkpoint(
        &self,
        task_id: Uuid,
        reason: TriggerReason,
    ) -> EngineResult<Checkpoint> {
        let completed: Vec<Uuid> = self
            .subtasks
            .list_for_task(task_id)
            .await?
            .into_iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .map(|s| s.id)
            .collect();

        let checkpoint = self.checkpoints.create(task_id, reason, completed).await?;

        // Pending tasks can trip the error rule before first allocation.
        if let Err(err) = self
            .tasks
            .update_status(
                task_id,
                &[
                    TaskStatus::Pending,
                    TaskStatus::Initializing,
                    TaskStatus::InProgress,
                ],
                TaskStatus::Checkpoint,
                None,
            )
            .await
        {
            debug!(task_id = %task_id, %err, "task not moved to checkpoint state");
        }
        self.cache
            .set_status(
                "task",
                task_id,
                TaskStatus::Checkpoint.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.bus
            .publish(
                task_id,
                &EventEnvelope::new(
                    EventType::CheckpointCreated,
                    serde_json::json!({
                        "checkpoint_id": checkpoint.id,
                        "task_id": task_id,
                        "trigger_reason": reason,
                    }),
                ),
            )
            .await?;

        Ok(checkpoint)
    }

    async fn resume_task(&self, task_id: Uuid) -> EngineResult<()> {
        self.tasks
            .update_status(
                task_id,
                &[TaskStatus::Checkpoint],
                TaskStatus::InProgress,
                None,
            )
            .await?;
        self.cache
            .set_status(
                "task",
                task_id,
                TaskStatus::InProgress.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.bus
            .publish(
                task_id,
                &EventEnvelope::new(
                    EventType::Status,
                    serde_json::json!({"task_id": task_id, "status": TaskStatus::InProgress}),
                ),
            )
            .await?;
        Ok(())
    }

    async fn cancel_task_for_rejection(&self, task_id: Uuid) -> EngineResult<()> {
        self.tasks
            .update_status(
                task_id,
                &[TaskStatus::Checkpoint],
                TaskStatus::Cancelled,
                None,
            )
            .await?;
        let live = self.subtasks.cancel_for_task(task_id).await?;
        for subtask_id in &live {
            self.cache.remove_live(*subtask_id).await?;
        }
        self.cache
            .set_status(
                "task",
                task_id,
                TaskStatus::Cancelled.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.bus
            .publish(
                task_id,
                &EventEnvelope::new(
                    EventType::TaskCancelled,
                    serde_json::json!({"task_id": task_id, "reason": "checkpoint_rejected"}),
                ),
            )
            .await?;
        Ok(())
    }

    /// Create one `code_fix` subtask per covered subtask still inside
    /// its correction budget. Returns (created, fix ids, at-limit count).
    async fn spawn_corrections(
        &self,
        checkpoint: &Checkpoint,
        feedback: &str,
    ) -> EngineResult<(usize, Vec<Uuid>, usize)> {
        let mut fixes: Vec<NewSubtask> = Vec::new();
        let mut originals: Vec<Subtask> = Vec::new();
        let mut at_limit = 0_usize;

        for subtask_id in &checkpoint.subtasks_completed {
            let Some(original) = self.subtasks.get(*subtask_id).await? else {
                continue;
            };
            if self.is_at_cycle_limit(*subtask_id).await? {
                at_limit += 1;
                continue;
            }

            fixes.push(NewSubtask {
                id: Uuid::now_v7(),
                task_id: checkpoint.task_id,
                name: format!("Fix: {}", original.name),
                description: format!(
                    "Apply the requested corrections to '{}'.\n\nReviewer feedback: {feedback}",
                    original.name
                ),
                subtask_type: SubtaskType::CodeFix,
                dependencies: vec![],
                recommended_tool: original.recommended_tool.clone(),
                complexity: original.complexity,
                priority: original.priority + 10,
            });
            originals.push(original);
        }

        if fixes.is_empty() {
            return Ok((0, Vec::new(), at_limit));
        }

        let fix_ids: Vec<Uuid> = fixes.iter().map(|f| f.id).collect();
        self.subtasks.create_batch(fixes).await?;

        for (original, fix_id) in originals.iter().zip(&fix_ids) {
            self.checkpoints
                .add_correction(
                    checkpoint.id,
                    original.id,
                    SubtaskType::CodeFix.as_str(),
                    &format!("fix subtask {fix_id}: {feedback}"),
                )
                .await?;
            self.subtasks
                .set_status(
                    original.id,
                    &[SubtaskStatus::Completed],
                    SubtaskStatus::Correcting,
                )
                .await?;
        }

        Ok((fix_ids.len(), fix_ids, at_limit))
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskmesh_kernel::{BreakerConfig, CircuitBreaker};
    use taskmesh_store::{
        CheckpointStatus, Database, NewTask, SubtaskOutcome, WorkerRegistration, WorkerStore,
    };

    struct Fixture {
        trigger: CheckpointTrigger,
        tasks: TaskStore,
        subtasks: SubtaskStore,
        checkpoints: CheckpointStore,
        workers: WorkerStore,
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig::default()).await
    }

    async fn fixture_with(config: EngineConfig) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let cache = CacheService::in_memory(CircuitBreaker::new("cache", BreakerConfig::cache()));
        let bus = EventBus::new(cache.clone(), Duration::from_secs(3600));
        let tasks = TaskStore::new(db.clone());
        let subtasks = SubtaskStore::new(db.clone());
        let checkpoints = CheckpointStore::new(db.clone());
        let workers = WorkerStore::new(db.clone());

        Fixture {
            trigger: CheckpointTrigger::new(
                tasks.clone(),
                subtasks.clone(),
                checkpoints.clone(),
                cache,
                bus,
                config,
            ),
            tasks,
            subtasks,
            checkpoints,
            workers,
        }
    }

    async fn in_progress_task(f: &Fixture) -> Uuid {
        let task = f
            .tasks
            .create(NewTask {
                description: "checkpoint trigger fixture".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        f.tasks
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await
            .unwrap();
        f.tasks
            .update_status(
                task.id,
                &[TaskStatus::Initializing],
                TaskStatus::InProgress,
                None,
            )
            .await
            .unwrap();
        task.id
    }

    async fn completed_subtask(f: &Fixture, task_id: Uuid, name: &str) -> Uuid {
        let worker = f
            .workers
            .register(WorkerRegistration {
                machine_id: format!("m-{name}"),
                machine_name: name.into(),
                system_info: Default::default(),
                tools: vec![],
                on_prem: false,
            })
            .await
            .unwrap();
        let s = NewSubtask {
            id: Uuid::now_v7(),
            task_id,
            name: name.into(),
            description: name.into(),
            subtask_type: SubtaskType::CodeGeneration,
            dependencies: vec![],
            recommended_tool: None,
            complexity: 2,
            priority: 0,
        };
        let id = s.id;
        f.subtasks.create_batch(vec![s]).await.unwrap();
        f.subtasks.bind(id, worker.id, None, 10, 50).await.unwrap();
        f.subtasks
            .release(
                id,
                SubtaskOutcome::Completed {
                    output: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn error_triggers_checkpoint() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;

        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .expect("checkpoint created");

        assert_eq!(checkpoint.trigger_reason, TriggerReason::ReviewIssuesFound);
        let task = f.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Checkpoint);
    }

    #[tokio::test]
    async fn error_trigger_can_be_disabled() {
        let f = fixture_with(EngineConfig {
            enable_error_trigger: false,
            ..EngineConfig::default()
        })
        .await;
        let task_id = in_progress_task(&f).await;

        let result = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn low_score_triggers_high_score_does_not() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;

        let none = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    evaluation_score: Some(8.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_none());

        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    evaluation_score: Some(5.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .expect("checkpoint created");
        assert_eq!(checkpoint.trigger_reason, TriggerReason::LowEvaluationScore);
    }

    #[tokio::test]
    async fn cadence_triggers_at_interval() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;

        // 3 completed of interval 5: no trigger.
        for i in 0..3 {
            completed_subtask(&f, task_id, &format!("s{i}")).await;
        }
        let last = completed_subtask(&f, task_id, "s3").await;
        let none = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    completed_subtask: Some(last),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_none());

        // Fifth completion hits the cadence.
        let fifth = completed_subtask(&f, task_id, "s4").await;
        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    completed_subtask: Some(fifth),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .expect("checkpoint created");
        assert_eq!(checkpoint.trigger_reason, TriggerReason::Periodic);
        assert_eq!(checkpoint.subtasks_completed.len(), 5);
    }

    #[tokio::test]
    async fn timeout_triggers_for_old_tasks() {
        let f = fixture_with(EngineConfig {
            task_timeout: Duration::from_secs(0),
            ..EngineConfig::default()
        })
        .await;
        let task_id = in_progress_task(&f).await;

        let checkpoint = f
            .trigger
            .check_and_trigger(task_id, TriggerContext::default())
            .await
            .unwrap()
            .expect("checkpoint created");
        assert_eq!(checkpoint.trigger_reason, TriggerReason::Timeout);
    }

    #[tokio::test]
    async fn no_trigger_for_terminal_or_paused_tasks() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;

        // Pause it once.
        f.trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        // Already checkpointed: the rule engine stays quiet.
        let again = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn missing_task_is_not_an_error() {
        let f = fixture().await;
        let result = f
            .trigger
            .check_and_trigger(
                Uuid::now_v7(),
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn accept_resumes_task() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;
        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = f
            .trigger
            .decide(checkpoint.id, UserDecision::Accept, None)
            .await
            .unwrap();
        assert_eq!(outcome.checkpoint.status, CheckpointStatus::Approved);

        let task = f.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn reject_cancels_task_and_subtasks() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;
        completed_subtask(&f, task_id, "done").await;
        // One live subtask that must be cancelled.
        let live = NewSubtask {
            id: Uuid::now_v7(),
            task_id,
            name: "Pending work".into(),
            description: "pending".into(),
            subtask_type: SubtaskType::Test,
            dependencies: vec![],
            recommended_tool: None,
            complexity: 1,
            priority: 0,
        };
        let live_id = live.id;
        f.subtasks.create_batch(vec![live]).await.unwrap();

        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = f
            .trigger
            .decide(checkpoint.id, UserDecision::Reject, Some("not viable".into()))
            .await
            .unwrap();
        assert_eq!(outcome.checkpoint.status, CheckpointStatus::Rejected);

        let task = f.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        let live = f.subtasks.get(live_id).await.unwrap().unwrap();
        assert_eq!(live.status, SubtaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn correct_spawns_fix_subtasks() {
        let f = fixture().await;
        let task_id = in_progress_task(&f).await;
        let done = completed_subtask(&f, task_id, "Code Generation").await;

        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    evaluation_score: Some(4.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = f
            .trigger
            .decide(
                checkpoint.id,
                UserDecision::Correct,
                Some("handle the empty-input case".into()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.corrections_created, 1);
        assert_eq!(outcome.fix_subtasks.len(), 1);
        assert_eq!(outcome.checkpoint.status, CheckpointStatus::Corrected);

        // Original is correcting; the fix subtask exists as code_fix.
        let original = f.subtasks.get(done).await.unwrap().unwrap();
        assert_eq!(original.status, SubtaskStatus::Correcting);
        let fix = f
            .subtasks
            .get(outcome.fix_subtasks[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fix.subtask_type, SubtaskType::CodeFix);
        assert!(fix.description.contains("empty-input"));

        assert_eq!(f.checkpoints.correction_cycles(done).await.unwrap(), 1);

        // Task resumed for the fixes to be scheduled.
        let task = f.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn cycle_limit_forces_manual_checkpoint() {
        let f = fixture_with(EngineConfig {
            max_correction_cycles: 1,
            ..EngineConfig::default()
        })
        .await;
        let task_id = in_progress_task(&f).await;
        let done = completed_subtask(&f, task_id, "Code Generation").await;

        // Exhaust the budget with a pre-existing correction.
        let checkpoint = f
            .trigger
            .check_and_trigger(
                task_id,
                TriggerContext {
                    error_occurred: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        f.checkpoints
            .add_correction(checkpoint.id, done, "code_fix", "round one")
            .await
            .unwrap();
        assert!(f.trigger.is_at_cycle_limit(done).await.unwrap());

        let outcome = f
            .trigger
            .decide(checkpoint.id, UserDecision::Correct, Some("again".into()))
            .await
            .unwrap();
        assert_eq!(outcome.corrections_created, 0);

        // A fresh manual checkpoint was raised and the task stays paused.
        let pending = f.checkpoints.pending_for_task(task_id).await.unwrap();
        let pending = pending.expect("manual checkpoint pending");
        assert_eq!(pending.trigger_reason, TriggerReason::Manual);
        let task = f.tasks.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Checkpoint);
    }
}
