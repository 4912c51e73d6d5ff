//! Task decomposition.
//!
//! Turns a typed task into its subtask DAG, either from the built-in
//! template for the task's type or from a stored workflow template.
//! Decomposition is idempotent per task, validates the DAG before any
//! insert, and writes the whole batch in one transaction. The
//! decomposer also owns the two derived questions the scheduler asks:
//! which subtasks are ready, and is the task finished.

use tracing::{debug, info, instrument};
use uuid::Uuid;

use taskmesh_kernel::{CacheService, EventBus, EventEnvelope, EventType};
use taskmesh_store::{
    NewSubtask, Subtask, SubtaskStore, SubtaskType, Task, TaskStatus, TaskStore, TemplateStore,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::templates::{builtin_template, validate_dag};

const CONTEXT_LIMIT: usize = 500;

/// A template step resolved to owned values, ready for insertion.
struct ResolvedStep {
    name: String,
    description: String,
    subtask_type: SubtaskType,
    recommended_tool: Option<String>,
    complexity: i32,
    priority: i32,
    depends_on: Vec<String>,
}

/// Template-driven task → subtask DAG expansion.
#[derive(Clone)]
pub struct Decomposer {
    tasks: TaskStore,
    subtasks: SubtaskStore,
    templates: TemplateStore,
    cache: CacheService,
    bus: EventBus,
    config: EngineConfig,
}

impl Decomposer {
    pub fn new(
        tasks: TaskStore,
        subtasks: SubtaskStore,
        templates: TemplateStore,
        cache: CacheService,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            templates,
            cache,
            bus,
            config,
        }
    }

    /// Expand a task using the built-in template for its type.
    #[instrument(skip(self))]
    pub async fn decompose(&self, task_id: Uuid) -> EngineResult<Vec<Subtask>> {
        let task = self.require_task(task_id).await?;
        let steps = builtin_template(task.task_type)
            .iter()
            .map(|step| ResolvedStep {
                name: step.name.to_string(),
                description: step.description.to_string(),
                subtask_type: step.subtask_type,
                recommended_tool: Some(step.recommended_tool.to_string()),
                complexity: step.complexity,
                priority: step.priority,
                depends_on: step.depends_on.iter().map(|d| d.to_string()).collect(),
            })
            .collect();
        self.insert_steps(&task, steps).await
    }

    /// Expand a task from a stored workflow template and bump its usage
    /// counter.
    #[instrument(skip(self))]
    pub async fn decompose_with_template(
        &self,
        task_id: Uuid,
        template_name: &str,
    ) -> EngineResult<Vec<Subtask>> {
        let task = self.require_task(task_id).await?;
        let template = self
            .templates
            .get_by_name(template_name)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow_template", template_name))?;

        let steps = template
            .steps
            .iter()
            .map(|step| ResolvedStep {
                name: step.name.clone(),
                description: step.description.clone(),
                subtask_type: step.subtask_type,
                recommended_tool: step.recommended_tool.clone(),
                complexity: step.complexity,
                priority: step.priority,
                depends_on: step.depends_on.clone(),
            })
            .collect();

        let subtasks = self.insert_steps(&task, steps).await?;
        self.templates.increment_usage(template.id).await?;
        Ok(subtasks)
    }

    /// Subtasks of the task that are pending with all dependencies
    /// completed, in allocation order.
    #[instrument(skip(self))]
    pub async fn ready_subtasks(&self, task_id: Uuid) -> EngineResult<Vec<Subtask>> {
        self.require_task(task_id).await?;
        Ok(self.subtasks.ready_subtasks(task_id).await?)
    }

    /// Recompute progress and, when every subtask is terminal, move the
    /// task to its final state. Returns the new terminal status, if any.
    #[instrument(skip(self))]
    pub async fn check_task_completion(&self, task_id: Uuid) -> EngineResult<Option<TaskStatus>> {
        let task = self.require_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(None);
        }

        let progress = self.subtasks.task_progress(task_id).await?;
        let percent = progress.percent();
        self.tasks.set_progress(task_id, percent).await?;

        self.bus
            .publish(
                task_id,
                &EventEnvelope::new(
                    EventType::Progress,
                    serde_json::json!({"task_id": task_id, "progress": percent}),
                ),
            )
            .await?;

        if !progress.all_terminal() {
            return Ok(None);
        }

        let final_status = if progress.failed > 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let updated = self
            .tasks
            .update_status(
                task_id,
                &[
                    TaskStatus::Initializing,
                    TaskStatus::InProgress,
                    TaskStatus::Checkpoint,
                ],
                final_status,
                None,
            )
            .await?;

        self.cache
            .set_status(
                "task",
                task_id,
                final_status.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.bus
            .publish(
                task_id,
                &EventEnvelope::new(
                    EventType::TaskCompleted,
                    serde_json::json!({
                        "task_id": task_id,
                        "status": final_status,
                        "progress": updated.progress,
                    }),
                ),
            )
            .await?;

        info!(task_id = %task_id, status = %final_status, "task reached terminal state");
        Ok(Some(final_status))
    }

    async fn require_task(&self, task_id: Uuid) -> EngineResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    async fn insert_steps(
        &self,
        task: &Task,
        steps: Vec<ResolvedStep>,
    ) -> EngineResult<Vec<Subtask>> {
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidState {
                message: format!("cannot decompose task in state {}", task.status),
            });
        }
        if self.subtasks.task_has_subtasks(task.id).await? {
            return Err(EngineError::AlreadyExists {
                resource: "subtask",
                detail: format!("task {} already has subtasks", task.id),
            });
        }

        // Validate before any insert: the DAG goes in whole or not at all.
        validate_dag(steps.iter().map(|step| {
            (
                step.name.as_str(),
                step.depends_on.iter().map(String::as_str).collect(),
            )
        }))?;

        let ids: Vec<Uuid> = steps.iter().map(|_| Uuid::now_v7()).collect();
        let id_by_name: std::collections::HashMap<&str, Uuid> = steps
            .iter()
            .zip(&ids)
            .map(|(step, id)| (step.name.as_str(), *id))
            .collect();

        let new_subtasks: Vec<NewSubtask> = steps
            .iter()
            .zip(&ids)
            .map(|(step, id)| NewSubtask {
                id: *id,
                task_id: task.id,
                name: step.name.clone(),
                description: enhance_description(&step.description, &task.description),
                subtask_type: step.subtask_type,
                dependencies: step
                    .depends_on
                    .iter()
                    .map(|name| id_by_name[name.as_str()])
                    .collect(),
                recommended_tool: step.recommended_tool.clone(),
                complexity: step.complexity,
                priority: step.priority,
            })
            .collect();

        let created = self.subtasks.create_batch(new_subtasks).await?;
        self.tasks
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await?;
        self.cache
            .set_status(
                "task",
                task.id,
                TaskStatus::Initializing.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;

        debug!(task_id = %task.id, subtasks = created.len(), "task decomposed");
        Ok(created)
    }
}

/// Append the task description as context, truncated so a pathological
/// submission cannot bloat every subtask row.
fn enhance_description(step_description: &str, task_description: &str) -> String {
    let context: String = task_description.chars().take(CONTEXT_LIMIT).collect();
    format!("{step_description}\n\nTask Context: {context}")
}

// ── tests ────────────────────────────────────────────────────────────
