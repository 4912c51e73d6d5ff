//! REST API route handlers.
//!
//! Thin translation between the versioned HTTP contract and the
//! engine's documented operations: parse, call, shape the response.
//! No orchestration logic lives here.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use taskmesh_engine::EngineError;
use taskmesh_store::{
    CheckpointFrequency, EvaluationScores, Heartbeat, NewTask, PrivacyLevel, SubtaskOutcome,
    SystemInfo, TaskStatus, TaskType, UserDecision, WorkerRegistration, WorkerStatus,
};

use crate::error::ApiResult;
use crate::state::AppState;

/// Parse an optional JSON body; an empty body yields the default.
fn parse_optional_body<T: Default + serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, crate::error::ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        EngineError::Validation {
            message: format!("invalid request body: {err}"),
        }
        .into()
    })
}

// ---------------------------------------------------------------------------
// POST /api/v1/tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub checkpoint_frequency: Option<CheckpointFrequency>,
    #[serde(default)]
    pub privacy_level: Option<PrivacyLevel>,
    #[serde(default)]
    pub tool_preferences: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    let task = state
        .orch
        .create_task(NewTask {
            description: body.description,
            task_type: body.task_type.unwrap_or(TaskType::DevelopFeature),
            priority: body.priority.unwrap_or(0),
            checkpoint_frequency: body
                .checkpoint_frequency
                .unwrap_or(CheckpointFrequency::Medium),
            privacy_level: body.privacy_level.unwrap_or(PrivacyLevel::Normal),
            tool_preferences: body.tool_preferences.unwrap_or_default(),
            metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id,
            status: task.status,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/v1/tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<taskmesh_store::Task>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<TaskListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::parse)
        .transpose()
        .map_err(EngineError::from)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let (tasks, total) = state.orch.tasks.list(status, limit, offset).await.map_err(EngineError::from)?;
    Ok(Json(TaskListResponse {
        tasks,
        total,
        limit,
        offset,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/tasks/{id}
// ---------------------------------------------------------------------------

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_engine::TaskDetail>> {
    Ok(Json(state.orch.task_detail(task_id).await?))
}

// ---------------------------------------------------------------------------
// POST /api/v1/tasks/{id}/decompose
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct DecomposeRequest {
    /// Apply a stored workflow template instead of the built-in one.
    pub template: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecomposeResponse {
    pub subtasks: Vec<taskmesh_store::Subtask>,
}

pub async fn decompose_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    body: axum::body::Bytes,
) -> ApiResult<Json<DecomposeResponse>> {
    let request: DecomposeRequest = parse_optional_body(&body)?;
    let template = request.template;
    let subtasks = match template {
        Some(name) => {
            state
                .orch
                .decomposer
                .decompose_with_template(task_id, &name)
                .await?
        }
        None => state.orch.decomposer.decompose(task_id).await?,
    };
    state.orch.scheduler.wake();
    Ok(Json(DecomposeResponse { subtasks }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/tasks/{id}/ready-subtasks
// ---------------------------------------------------------------------------

pub async fn ready_subtasks(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Vec<taskmesh_store::Subtask>>> {
    Ok(Json(state.orch.decomposer.ready_subtasks(task_id).await?))
}

// ---------------------------------------------------------------------------
// POST /api/v1/tasks/{id}/schedule
// ---------------------------------------------------------------------------

pub async fn schedule_now(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_engine::CycleReport>> {
    // Existence check keeps 404 semantics for unknown tasks.
    state.orch.task_detail(task_id).await?;
    Ok(Json(state.orch.scheduler.run_cycle().await?))
}

// ---------------------------------------------------------------------------
// POST /api/v1/tasks/{id}/cancel
// ---------------------------------------------------------------------------

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_store::Task>> {
    Ok(Json(state.orch.scheduler.cancel_task(task_id).await?))
}

// ---------------------------------------------------------------------------
// GET /api/v1/subtasks/{id}
// ---------------------------------------------------------------------------

pub async fn get_subtask(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_store::Subtask>> {
    let subtask = state
        .orch
        .subtasks
        .get(subtask_id)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| EngineError::not_found("subtask", subtask_id))?;
    Ok(Json(subtask))
}

// ---------------------------------------------------------------------------
// POST /api/v1/subtasks/{id}/allocate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AllocateResponse {
    Bound {
        subtask: taskmesh_store::Subtask,
        worker_id: Uuid,
    },
    Queued {
        subtask_id: Uuid,
    },
}

pub async fn allocate_subtask(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> ApiResult<Json<AllocateResponse>> {
    let response = match state.orch.allocator.allocate(subtask_id).await? {
        taskmesh_engine::AllocationOutcome::Bound { subtask, worker_id } => {
            AllocateResponse::Bound { subtask, worker_id }
        }
        taskmesh_engine::AllocationOutcome::Queued { subtask_id } => {
            AllocateResponse::Queued { subtask_id }
        }
    };
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// POST /api/v1/subtasks/{id}/result
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubtaskResultRequest {
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

pub async fn report_subtask_result(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
    Json(body): Json<SubtaskResultRequest>,
) -> ApiResult<Json<taskmesh_store::Subtask>> {
    let outcome = match body.status.as_str() {
        "completed" => SubtaskOutcome::Completed {
            output: body.output.unwrap_or_else(|| serde_json::json!({})),
        },
        "failed" => SubtaskOutcome::Failed {
            error: body
                .error
                .unwrap_or_else(|| "worker reported failure".into()),
        },
        other => {
            return Err(EngineError::Validation {
                message: format!("result status must be completed or failed, got {other}"),
            }
            .into());
        }
    };

    Ok(Json(
        state.orch.report_subtask_result(subtask_id, outcome).await?,
    ))
}

// ---------------------------------------------------------------------------
// POST /api/v1/subtasks/{id}/evaluations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EvaluationRequest {
    #[serde(flatten)]
    pub scores: EvaluationScores,
    #[serde(default)]
    pub details: Option<Value>,
}

pub async fn record_evaluation(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
    Json(body): Json<EvaluationRequest>,
) -> ApiResult<Json<taskmesh_store::Evaluation>> {
    let evaluation = state
        .orch
        .record_evaluation(
            subtask_id,
            body.scores,
            body.details.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;
    Ok(Json(evaluation))
}

// ---------------------------------------------------------------------------
// POST /api/v1/workers/register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub machine_id: String,
    pub machine_name: String,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub on_prem: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: Uuid,
    pub status: WorkerStatus,
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorkerRequest>,
) -> ApiResult<Json<RegisterWorkerResponse>> {
    if body.machine_id.trim().is_empty() {
        return Err(EngineError::Validation {
            message: "machine_id must not be empty".into(),
        }
        .into());
    }

    let worker = state
        .orch
        .register_worker(WorkerRegistration {
            machine_id: body.machine_id,
            machine_name: body.machine_name,
            system_info: body.system_info.unwrap_or_default(),
            tools: body.tools,
            on_prem: body.on_prem,
        })
        .await?;
    state.orch.scheduler.wake();

    Ok(Json(RegisterWorkerResponse {
        worker_id: worker.id,
        status: worker.status,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/workers/{id}/heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
}

pub async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    Json(body): Json<HeartbeatRequest>,
) -> ApiResult<Json<taskmesh_store::Worker>> {
    let worker = state
        .orch
        .ingest_heartbeat(
            worker_id,
            Heartbeat {
                status: body.status.unwrap_or(WorkerStatus::Online),
                cpu_percent: body.cpu_percent,
                memory_percent: body.memory_percent,
                disk_percent: body.disk_percent,
            },
        )
        .await?;
    Ok(Json(worker))
}

// ---------------------------------------------------------------------------
// POST /api/v1/workers/{id}/unregister
// ---------------------------------------------------------------------------

pub async fn unregister_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_store::Worker>> {
    Ok(Json(state.orch.unregister_worker(worker_id).await?))
}

// ---------------------------------------------------------------------------
// GET /api/v1/workers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WorkerListQuery {
    pub status: Option<String>,
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<WorkerListQuery>,
) -> ApiResult<Json<Vec<taskmesh_store::Worker>>> {
    let status = query
        .status
        .as_deref()
        .map(WorkerStatus::parse)
        .transpose()
        .map_err(EngineError::from)?;
    Ok(Json(
        state.orch.workers.list(status).await.map_err(EngineError::from)?,
    ))
}

// ---------------------------------------------------------------------------
// GET /api/v1/tasks/{id}/checkpoints
// ---------------------------------------------------------------------------

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Vec<taskmesh_store::Checkpoint>>> {
    state.orch.task_detail(task_id).await?;
    Ok(Json(
        state
            .orch
            .checkpoints
            .list_for_task(task_id)
            .await
            .map_err(EngineError::from)?,
    ))
}

// ---------------------------------------------------------------------------
// POST /api/v1/checkpoints/{id}/decision
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: UserDecision,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub checkpoint: taskmesh_store::Checkpoint,
    pub corrections_created: usize,
    pub fix_subtasks: Vec<Uuid>,
}

pub async fn checkpoint_decision(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Json(body): Json<DecisionRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let outcome = state
        .orch
        .trigger
        .decide(checkpoint_id, body.decision, body.feedback)
        .await?;
    state.orch.scheduler.wake();

    Ok(Json(DecisionResponse {
        checkpoint: outcome.checkpoint,
        corrections_created: outcome.corrections_created,
        fix_subtasks: outcome.fix_subtasks,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/checkpoints/{id}/rollback/preview
// POST /api/v1/checkpoints/{id}/rollback
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub delete_evaluations: bool,
}

pub async fn rollback_preview(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
) -> ApiResult<Json<taskmesh_store::RollbackReport>> {
    Ok(Json(state.orch.trigger.rollback_preview(checkpoint_id).await?))
}

pub async fn rollback_execute(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    body: axum::body::Bytes,
) -> ApiResult<Json<taskmesh_store::RollbackReport>> {
    let request: RollbackRequest = parse_optional_body(&body)?;
    let delete_evaluations = request.delete_evaluations;
    let report = state
        .orch
        .trigger
        .rollback(checkpoint_id, delete_evaluations)
        .await?;
    state.orch.scheduler.wake();
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// GET /api/v1/scheduler/stats
// ---------------------------------------------------------------------------

pub async fn scheduler_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<taskmesh_engine::SchedulerStatus>> {
    Ok(Json(state.orch.scheduler.status().await?))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pools: taskmesh_kernel::PoolHealthReport,
    pub breakers: Vec<(String, taskmesh_kernel::BreakerStats)>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pools = state.orch.pool_monitor.health();
    Json(HealthResponse {
        status: if pools.healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        pools,
        breakers: state.orch.breakers.all_stats(),
    })
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

pub async fn metrics(State(state): State<AppState>) -> ApiResult<String> {
    state.orch.refresh_gauges().await?;
    Ok(state.orch.metrics.render())
}
