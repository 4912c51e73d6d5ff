//! Engine assembly and the operations the edge calls.
//!
//! [`Orchestrator::new`] performs all construction and dependency
//! injection explicitly: stores over one database handle, the cache
//! service behind its breaker, the event bus, then the allocator,
//! decomposer, checkpoint trigger, scheduler, and health checker on
//! top. There is no process-global state; the edge holds one
//! `Orchestrator` and the background loops run until `shutdown`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

use taskmesh_kernel::{
    BreakerConfig, BreakerRegistry, CacheService, EventBus, Metrics, PoolMonitor, PoolSampler,
    PoolThresholds, AdmissionGate, MemoryBackend,
};
use taskmesh_store::{
    CheckpointStore, Database, Evaluation, EvaluationScores, EvaluationStore, Heartbeat, NewTask,
    Subtask, SubtaskOutcome, SubtaskStore, Task, TaskStore, TemplateStore, Worker,
    WorkerRegistration, WorkerStatus, WorkerStore,
};

use crate::allocator::Allocator;
use crate::checkpoint::{CheckpointTrigger, TriggerContext};
use crate::config::EngineConfig;
use crate::decomposer::Decomposer;
use crate::error::{EngineError, EngineResult};
use crate::health::HealthChecker;
use crate::scheduler::Scheduler;

/// A task with its subtasks, as returned by the detail endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

/// The fully wired engine.
pub struct Orchestrator {
    pub config: EngineConfig,
    pub tasks: TaskStore,
    pub subtasks: SubtaskStore,
    pub workers: WorkerStore,
    pub checkpoints: CheckpointStore,
    pub evaluations: EvaluationStore,
    pub templates: TemplateStore,
    pub cache: CacheService,
    pub bus: EventBus,
    pub metrics: Metrics,
    pub breakers: BreakerRegistry,
    pub allocator: Allocator,
    pub decomposer: Decomposer,
    pub trigger: CheckpointTrigger,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthChecker>,
    pub pool_monitor: Arc<PoolMonitor>,
    pub admission: AdmissionGate,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire the engine over an opened database with the in-process
    /// cache backend. Pool samplers come from the caller so the edge
    /// can plug in real pool introspection.
    pub fn new(
        db: Database,
        config: EngineConfig,
        pool_samplers: Vec<Arc<dyn PoolSampler>>,
    ) -> Arc<Self> {
        let breakers = BreakerRegistry::new();
        let cache_breaker = breakers.get_or_create("cache", BreakerConfig::cache());
        breakers.get_or_create("database", BreakerConfig::database());

        let cache = CacheService::new(Arc::new(MemoryBackend::new()), cache_breaker);
        let bus = EventBus::new(cache.clone(), config.mailbox_ttl);
        let metrics = Metrics::new();

        let tasks = TaskStore::new(db.clone());
        let subtasks = SubtaskStore::new(db.clone());
        let workers = WorkerStore::new(db.clone());
        let checkpoints = CheckpointStore::new(db.clone());
        let evaluations = EvaluationStore::new(db.clone());
        let templates = TemplateStore::new(db);

        let allocator = Allocator::new(
            tasks.clone(),
            subtasks.clone(),
            workers.clone(),
            cache.clone(),
            bus.clone(),
            config.clone(),
        );
        let decomposer = Decomposer::new(
            tasks.clone(),
            subtasks.clone(),
            templates.clone(),
            cache.clone(),
            bus.clone(),
            config.clone(),
        );
        let trigger = CheckpointTrigger::new(
            tasks.clone(),
            subtasks.clone(),
            checkpoints.clone(),
            cache.clone(),
            bus.clone(),
            config.clone(),
        );
        let scheduler = Scheduler::new(
            tasks.clone(),
            subtasks.clone(),
            allocator.clone(),
            decomposer.clone(),
            trigger.clone(),
            cache.clone(),
            bus.clone(),
            metrics.clone(),
            config.clone(),
        );
        let health = HealthChecker::new(
            workers.clone(),
            subtasks.clone(),
            cache.clone(),
            bus.clone(),
            config.clone(),
        );

        let pool_monitor = PoolMonitor::new(pool_samplers, PoolThresholds::default());
        let admission = AdmissionGate::new(Arc::clone(&pool_monitor));

        Arc::new(Self {
            config,
            tasks,
            subtasks,
            workers,
            checkpoints,
            evaluations,
            templates,
            cache,
            bus,
            metrics,
            breakers,
            allocator,
            decomposer,
            trigger,
            scheduler,
            health,
            pool_monitor,
            admission,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the scheduler loop, health checker, and pool monitor.
    pub fn start_background(&self) {
        let mut handles = self.background.lock().unwrap_or_else(|e| e.into_inner());
        handles.push(self.scheduler.start());
        handles.push(self.health.start());
        handles.push(self.pool_monitor.start(Duration::from_secs(30)));
        info!("background services started");
    }

    /// Signal every background loop to stop and wait for them.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.health.stop();
        self.pool_monitor.stop();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("background services stopped");
    }

    // ── task operations ──────────────────────────────────────────────

    #[instrument(skip(self, new))]
    pub async fn create_task(&self, new: NewTask) -> EngineResult<Task> {
        if new.description.len() < 10 {
            return Err(EngineError::Validation {
                message: "task description must be at least 10 characters".into(),
            });
        }
        let task = self.tasks.create(new).await?;
        self.metrics
            .inc("taskmesh_tasks_created_total", &[("type", task.task_type.as_str())]);
        self.cache
            .set_status(
                "task",
                task.id,
                task.status.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        Ok(task)
    }

    pub async fn task_detail(&self, task_id: Uuid) -> EngineResult<TaskDetail> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        let subtasks = self.subtasks.list_for_task(task_id).await?;
        Ok(TaskDetail { task, subtasks })
    }

    // ── worker operations ────────────────────────────────────────────

    #[instrument(skip(self, registration), fields(machine_id = %registration.machine_id))]
    pub async fn register_worker(&self, registration: WorkerRegistration) -> EngineResult<Worker> {
        let worker = self.workers.register(registration).await?;
        self.cache
            .set_status(
                "worker",
                worker.id,
                worker.status.as_str(),
                self.config.worker_mirror_ttl(),
            )
            .await;
        Ok(worker)
    }

    #[instrument(skip(self, beat))]
    pub async fn ingest_heartbeat(&self, worker_id: Uuid, beat: Heartbeat) -> EngineResult<Worker> {
        let worker = self.workers.heartbeat(worker_id, beat).await?;
        self.cache
            .set_status(
                "worker",
                worker.id,
                worker.status.as_str(),
                self.config.worker_mirror_ttl(),
            )
            .await;
        Ok(worker)
    }

    /// Graceful shutdown: offline the worker and requeue anything it
    /// still held, exactly as the health checker would.
    #[instrument(skip(self))]
    pub async fn unregister_worker(&self, worker_id: Uuid) -> EngineResult<Worker> {
        let orphans = self.workers.mark_offline_and_requeue(worker_id).await?;
        for subtask_id in orphans {
            self.cache.requeue_atomic(subtask_id).await?;
        }
        self.cache
            .set_status(
                "worker",
                worker_id,
                WorkerStatus::Offline.as_str(),
                self.config.worker_mirror_ttl(),
            )
            .await;
        self.scheduler.wake();
        self.workers
            .get(worker_id)
            .await?
            .ok_or_else(|| EngineError::not_found("worker", worker_id))
    }

    // ── evaluations ──────────────────────────────────────────────────

    /// Record an evaluator verdict and consult the checkpoint trigger
    /// with the fresh overall score.
    #[instrument(skip(self, scores, details))]
    pub async fn record_evaluation(
        &self,
        subtask_id: Uuid,
        scores: EvaluationScores,
        details: serde_json::Value,
    ) -> EngineResult<Evaluation> {
        let subtask = self
            .subtasks
            .get(subtask_id)
            .await?
            .ok_or_else(|| EngineError::not_found("subtask", subtask_id))?;

        let evaluation = self
            .evaluations
            .record(subtask_id, scores, details, &self.config.score_weights)
            .await?;
        self.metrics.set_gauge(
            "taskmesh_last_evaluation_score",
            &[("subtask_type", subtask.subtask_type.as_str())],
            evaluation.overall_score,
        );

        self.trigger
            .check_and_trigger(
                subtask.task_id,
                TriggerContext {
                    evaluation_score: Some(evaluation.overall_score),
                    ..Default::default()
                },
            )
            .await?;

        Ok(evaluation)
    }

    // ── subtask results ──────────────────────────────────────────────

    pub async fn report_subtask_result(
        &self,
        subtask_id: Uuid,
        outcome: SubtaskOutcome,
    ) -> EngineResult<Subtask> {
        self.scheduler.handle_subtask_result(subtask_id, outcome).await
    }

    // ── metrics refresh ──────────────────────────────────────────────

    /// Refresh gauges from batched store aggregates; called by the
    /// metrics endpoint right before rendering.
    pub async fn refresh_gauges(&self) -> EngineResult<()> {
        for (status, count) in self.tasks.count_by_status().await? {
            self.metrics.set_gauge(
                "taskmesh_tasks",
                &[("status", status.as_str())],
                count as f64,
            );
        }
        for (status, count) in self.subtasks.count_by_status().await? {
            self.metrics.set_gauge(
                "taskmesh_subtasks",
                &[("status", status.as_str())],
                count as f64,
            );
        }
        for (tool, count) in self.subtasks.count_by_tool().await? {
            self.metrics.set_gauge(
                "taskmesh_subtasks_by_tool",
                &[("tool", tool.as_str())],
                count as f64,
            );
        }
        for (status, count) in self.workers.count_by_status().await? {
            self.metrics.set_gauge(
                "taskmesh_workers",
                &[("status", status.as_str())],
                count as f64,
            );
        }
        if let Some(average) = self.evaluations.average_overall().await? {
            self.metrics
                .set_gauge("taskmesh_evaluation_overall_avg", &[], average);
        }
        let queue_len = self.cache.queue_len().await.unwrap_or(0);
        self.metrics
            .set_gauge("taskmesh_queue_depth", &[], queue_len as f64);
        for (name, stats) in self.breakers.all_stats() {
            let state = match stats.state {
                taskmesh_kernel::CircuitState::Closed => 0.0,
                taskmesh_kernel::CircuitState::HalfOpen => 1.0,
                taskmesh_kernel::CircuitState::Open => 2.0,
            };
            self.metrics
                .set_gauge("taskmesh_breaker_state", &[("breaker", name.as_str())], state);
        }
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
