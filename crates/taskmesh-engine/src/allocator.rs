//! Subtask allocation.
//!
//! For one ready subtask, the allocator either binds exactly one capable
//! worker or parks the subtask on the pending queue. Candidate scoring
//! is capability-first:
//!
//! ```text
//! score = 0.50 * tool_match + 0.30 * resource_fit + 0.20 * privacy_match
//! ```
//!
//! `tool_match` is 1.0 for an exact tool, 0.7 for a documented
//! near-match, and disqualifying otherwise; workers above any resource
//! threshold are disqualified outright. Ties break on lower current
//! load, then lower worker id, deterministic across replicas.
//!
//! The bind itself happens in the store's single transaction with every
//! invariant re-checked; the cache's queue/in-progress move follows the
//! committed bind, never precedes it.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskmesh_kernel::{CacheService, EventBus, EventEnvelope, EventType};
use taskmesh_store::{
    PrivacyLevel, ReleaseResult, Subtask, SubtaskOutcome, SubtaskStatus, SubtaskStore, TaskStatus,
    TaskStore, Worker, WorkerStatus, WorkerStore,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::router::Router;

/// Tools that can stand in for each other at reduced score.
fn near_matches(tool: &str) -> &'static [&'static str] {
    match tool {
        "claude_code" => &["gemini_cli", "codex_cli"],
        "gemini_cli" => &["claude_code", "codex_cli"],
        "codex_cli" => &["claude_code", "gemini_cli"],
        _ => &[],
    }
}

/// How an allocation attempt ended.
#[derive(Debug, Clone)]
pub enum AllocationOutcome {
    /// Bound to a worker; carries the updated subtask.
    Bound { subtask: Subtask, worker_id: Uuid },
    /// No qualified worker; parked on the pending queue.
    Queued { subtask_id: Uuid },
}

struct ScoredCandidate {
    worker: Worker,
    load: i64,
    score: f64,
    tool: Option<String>,
}

/// Capability/resource/privacy scoring and atomic binding.
#[derive(Clone)]
pub struct Allocator {
    tasks: TaskStore,
    subtasks: SubtaskStore,
    workers: WorkerStore,
    cache: CacheService,
    bus: EventBus,
    router: Router,
    config: EngineConfig,
}

impl Allocator {
    pub fn new(
        tasks: TaskStore,
        subtasks: SubtaskStore,
        workers: WorkerStore,
        cache: CacheService,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            workers,
            cache,
            bus,
            router: Router::new(config.exploration_rate),
            config,
        }
    }

    /// Allocate one subtask: bind the best candidate or enqueue.
    #[instrument(skip(self))]
    pub async fn allocate(&self, subtask_id: Uuid) -> EngineResult<AllocationOutcome> {
        let subtask = self
            .subtasks
            .get(subtask_id)
            .await?
            .ok_or_else(|| EngineError::not_found("subtask", subtask_id))?;
        if !matches!(
            subtask.status,
            SubtaskStatus::Pending | SubtaskStatus::Queued
        ) {
            return Err(EngineError::InvalidState {
                message: format!("cannot allocate subtask in state {}", subtask.status),
            });
        }

        let task = self
            .tasks
            .get(subtask.task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", subtask.task_id))?;

        let mut candidates = self.score_candidates(&subtask, task.privacy_level).await?;
        if candidates.is_empty() {
            return self.enqueue(&subtask).await;
        }

        // Best first; router may explore among the qualified set.
        let scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let chosen = self.router.select_index(&scores);
        if chosen > 0 {
            debug!(subtask_id = %subtask_id, chosen, "router explored a non-best candidate");
            candidates.swap(0, chosen);
        }

        for candidate in &candidates {
            match self
                .subtasks
                .bind(
                    subtask.id,
                    candidate.worker.id,
                    candidate.tool.clone(),
                    self.config.max_subtasks_per_worker,
                    self.config.max_concurrent_subtasks,
                )
                .await
            {
                Ok(bound) => {
                    self.after_bind(&bound, &candidate.worker, &task.status).await;
                    info!(
                        subtask_id = %subtask.id,
                        worker_id = %candidate.worker.id,
                        score = candidate.score,
                        "subtask bound"
                    );
                    return Ok(AllocationOutcome::Bound {
                        subtask: bound,
                        worker_id: candidate.worker.id,
                    });
                }
                // Lost a race for this worker; try the next candidate.
                Err(taskmesh_store::StoreError::InvalidState { reason, .. }) => {
                    debug!(
                        subtask_id = %subtask.id,
                        worker_id = %candidate.worker.id,
                        %reason,
                        "bind re-check failed; trying next candidate"
                    );
                }
                Err(other) => return Err(other.into()),
            }
        }

        self.enqueue(&subtask).await
    }

    /// Record a worker-reported outcome and release the binding.
    #[instrument(skip(self, outcome))]
    pub async fn release(
        &self,
        subtask_id: Uuid,
        outcome: SubtaskOutcome,
    ) -> EngineResult<ReleaseResult> {
        let released = self.subtasks.release(subtask_id, outcome).await?;
        let subtask = &released.subtask;

        self.cache.remove_live(subtask_id).await?;
        self.cache
            .set_status(
                "subtask",
                subtask_id,
                subtask.status.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        if let Some(worker_id) = released.worker_id {
            let status = if released.worker_idle {
                WorkerStatus::Idle
            } else {
                WorkerStatus::Busy
            };
            self.cache
                .set_status(
                    "worker",
                    worker_id,
                    status.as_str(),
                    self.config.worker_mirror_ttl(),
                )
                .await;
        }

        self.bus
            .publish(
                subtask.task_id,
                &EventEnvelope::new(
                    EventType::Status,
                    serde_json::json!({
                        "subtask_id": subtask.id,
                        "name": subtask.name,
                        "status": subtask.status,
                        "error": subtask.error,
                    }),
                ),
            )
            .await?;

        Ok(released)
    }

    /// Statistics for the scheduler stats endpoint.
    pub async fn allocation_stats(&self) -> EngineResult<AllocationStats> {
        Ok(AllocationStats {
            queue_length: self.cache.queue_len().await?,
            in_progress_count: self.subtasks.in_progress_count().await?,
            online_workers: self.workers.available_with_load().await?.len(),
        })
    }

    async fn score_candidates(
        &self,
        subtask: &Subtask,
        privacy: PrivacyLevel,
    ) -> EngineResult<Vec<ScoredCandidate>> {
        let available = self.workers.available_with_load().await?;

        let mut scored = Vec::new();
        for (worker, load) in available {
            if load >= self.config.max_subtasks_per_worker {
                continue;
            }
            let Some(resource_fit) = self.resource_fit(&worker) else {
                continue;
            };
            let (tool_match, tool) = self.tool_match(subtask, &worker);
            if tool_match <= 0.0 {
                continue;
            }
            let privacy_match = if privacy == PrivacyLevel::Sensitive {
                if worker.on_prem {
                    1.0
                } else {
                    0.5
                }
            } else {
                0.5
            };

            let score = self.config.tool_weight * tool_match
                + self.config.resource_weight * resource_fit
                + self.config.privacy_weight * privacy_match;
            scored.push(ScoredCandidate {
                worker,
                load,
                score,
                tool,
            });
        }

        // Highest score first; equal scores go to the less loaded,
        // then the lower id.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.load.cmp(&b.load))
                .then(a.worker.id.cmp(&b.worker.id))
        });
        Ok(scored)
    }

    /// 1.0 exact, 0.7 near-match, 0.0 disqualified; tasks without a
    /// recommended tool accept any worker at full score.
    fn tool_match(&self, subtask: &Subtask, worker: &Worker) -> (f64, Option<String>) {
        let Some(wanted) = subtask.recommended_tool.as_deref() else {
            return (1.0, worker.tools.first().cloned());
        };
        if worker.tools.iter().any(|t| t == wanted) {
            return (1.0, Some(wanted.to_string()));
        }
        for alternative in near_matches(wanted) {
            if worker.tools.iter().any(|t| t == alternative) {
                return (0.7, Some((*alternative).to_string()));
            }
        }
        (0.0, None)
    }

    /// `1 - max(cpu, mem, disk)/100`, or `None` when any pressure
    /// crosses its disqualification threshold.
    fn resource_fit(&self, worker: &Worker) -> Option<f64> {
        if worker.cpu_percent >= self.config.cpu_threshold
            || worker.memory_percent >= self.config.memory_threshold
            || worker.disk_percent >= self.config.disk_threshold
        {
            return None;
        }
        let worst = worker
            .cpu_percent
            .max(worker.memory_percent)
            .max(worker.disk_percent);
        Some((1.0 - worst / 100.0).clamp(0.0, 1.0))
    }

    async fn after_bind(&self, subtask: &Subtask, worker: &Worker, task_status: &TaskStatus) {
        // Queue → in-progress move follows the committed bind.
        if let Err(err) = self.cache.mark_in_progress(subtask.id).await {
            warn!(subtask_id = %subtask.id, %err, "cache in-progress move failed");
        }
        self.cache
            .set_status(
                "subtask",
                subtask.id,
                SubtaskStatus::InProgress.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.cache
            .set_status(
                "worker",
                worker.id,
                WorkerStatus::Busy.as_str(),
                self.config.worker_mirror_ttl(),
            )
            .await;

        // First allocation moves the task into in_progress.
        if matches!(task_status, TaskStatus::Initializing) {
            if let Err(err) = self
                .tasks
                .update_status(
                    subtask.task_id,
                    &[TaskStatus::Initializing],
                    TaskStatus::InProgress,
                    None,
                )
                .await
            {
                debug!(task_id = %subtask.task_id, %err, "task already moved out of initializing");
            } else {
                self.cache
                    .set_status(
                        "task",
                        subtask.task_id,
                        TaskStatus::InProgress.as_str(),
                        self.config.status_mirror_ttl,
                    )
                    .await;
            }
        }

        let _ = self
            .bus
            .publish(
                subtask.task_id,
                &EventEnvelope::new(
                    EventType::Status,
                    serde_json::json!({
                        "subtask_id": subtask.id,
                        "name": subtask.name,
                        "status": subtask.status,
                        "assigned_worker": subtask.assigned_worker,
                        "assigned_tool": subtask.assigned_tool,
                    }),
                ),
            )
            .await;
    }

    async fn enqueue(&self, subtask: &Subtask) -> EngineResult<AllocationOutcome> {
        if subtask.status != SubtaskStatus::Queued {
            self.subtasks
                .set_status(subtask.id, &[SubtaskStatus::Pending], SubtaskStatus::Queued)
                .await?;
        }
        self.cache.queue_push(subtask.id).await?;
        self.cache
            .set_status(
                "subtask",
                subtask.id,
                SubtaskStatus::Queued.as_str(),
                self.config.status_mirror_ttl,
            )
            .await;
        self.bus
            .publish(
                subtask.task_id,
                &EventEnvelope::new(
                    EventType::SubtaskQueued,
                    serde_json::json!({"subtask_id": subtask.id, "name": subtask.name}),
                ),
            )
            .await?;

        debug!(subtask_id = %subtask.id, "no qualified worker; subtask queued");
        Ok(AllocationOutcome::Queued {
            subtask_id: subtask.id,
        })
    }
}

/// Point-in-time allocation counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AllocationStats {
    pub queue_length: usize,
    pub in_progress_count: i64,
    pub online_workers: usize,
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskmesh_kernel::{BreakerConfig, CircuitBreaker};
    use taskmesh_store::{
        Database, Heartbeat, NewSubtask, NewTask, SubtaskType, SystemInfo, WorkerRegistration,
    };

    struct Fixture {
        allocator: Allocator,
        tasks: TaskStore,
        subtasks: SubtaskStore,
        workers: WorkerStore,
        cache: CacheService,
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig {
            exploration_rate: 0.0,
            ..EngineConfig::default()
        })
        .await
    }

    async fn fixture_with(config: EngineConfig) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let cache = CacheService::in_memory(CircuitBreaker::new("cache", BreakerConfig::cache()));
        let bus = EventBus::new(cache.clone(), Duration::from_secs(3600));
        let tasks = TaskStore::new(db.clone());
        let subtasks = SubtaskStore::new(db.clone());
        let workers = WorkerStore::new(db.clone());

        Fixture {
            allocator: Allocator::new(
                tasks.clone(),
                subtasks.clone(),
                workers.clone(),
                cache.clone(),
                bus,
                config,
            ),
            tasks,
            subtasks,
            workers,
            cache,
        }
    }

    async fn make_subtask(f: &Fixture, tool: Option<&str>) -> Uuid {
        let task = f
            .tasks
            .create(NewTask {
                description: "allocator fixture task".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        let subtask = NewSubtask {
            id: Uuid::now_v7(),
            task_id: task.id,
            name: "Code Generation".into(),
            description: "generate code".into(),
            subtask_type: SubtaskType::CodeGeneration,
            dependencies: vec![],
            recommended_tool: tool.map(str::to_string),
            complexity: 3,
            priority: 5,
        };
        let id = subtask.id;
        f.subtasks.create_batch(vec![subtask]).await.unwrap();
        f.tasks
            .update_status(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::Initializing,
                None,
            )
            .await
            .unwrap();
        id
    }

    async fn make_worker(f: &Fixture, machine: &str, tools: &[&str]) -> Uuid {
        f.workers
            .register(WorkerRegistration {
                machine_id: machine.into(),
                machine_name: machine.into(),
                system_info: SystemInfo::default(),
                tools: tools.iter().map(|t| t.to_string()).collect(),
                on_prem: false,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn binds_exact_tool_match() {
        let f = fixture().await;
        let worker = make_worker(&f, "m1", &["claude_code"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Bound { subtask, worker_id } => {
                assert_eq!(worker_id, worker);
                assert_eq!(subtask.assigned_tool.as_deref(), Some("claude_code"));
                assert_eq!(subtask.status, SubtaskStatus::InProgress);
            }
            other => panic!("expected bind, got {other:?}"),
        }

        // Task moved to in_progress on first allocation.
        let subtask = f.subtasks.get(subtask_id).await.unwrap().unwrap();
        let task = f.tasks.get(subtask.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(f.cache.in_progress_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn near_match_used_when_exact_unavailable() {
        let f = fixture().await;
        make_worker(&f, "m1", &["gemini_cli"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Bound { subtask, .. } => {
                assert_eq!(subtask.assigned_tool.as_deref(), Some("gemini_cli"));
            }
            other => panic!("expected bind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_tool_queues() {
        let f = fixture().await;
        make_worker(&f, "m1", &["ollama"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Queued { .. } => {}
            other => panic!("expected queue, got {other:?}"),
        }
        let subtask = f.subtasks.get(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Queued);
        assert_eq!(f.cache.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn no_workers_queues() {
        let f = fixture().await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Queued { subtask_id: id } => assert_eq!(id, subtask_id),
            other => panic!("expected queue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overloaded_worker_disqualified() {
        let f = fixture().await;
        let worker = make_worker(&f, "m1", &["claude_code"]).await;
        f.workers
            .heartbeat(
                worker,
                Heartbeat {
                    status: WorkerStatus::Online,
                    cpu_percent: 95.0,
                    memory_percent: 10.0,
                    disk_percent: 10.0,
                },
            )
            .await
            .unwrap();
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Queued { .. } => {}
            other => panic!("expected queue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefers_exact_over_near_match() {
        let f = fixture().await;
        let near = make_worker(&f, "near", &["gemini_cli"]).await;
        let exact = make_worker(&f, "exact", &["claude_code"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;

        match f.allocator.allocate(subtask_id).await.unwrap() {
            AllocationOutcome::Bound { worker_id, .. } => {
                assert_eq!(worker_id, exact);
                assert_ne!(worker_id, near);
            }
            other => panic!("expected bind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_worker_cap_respected() {
        let f = fixture().await;
        make_worker(&f, "m1", &["claude_code"]).await;
        let first = make_subtask(&f, Some("claude_code")).await;
        let second = make_subtask(&f, Some("claude_code")).await;

        assert!(matches!(
            f.allocator.allocate(first).await.unwrap(),
            AllocationOutcome::Bound { .. }
        ));
        // Worker is busy now (cap 1); second subtask queues.
        assert!(matches!(
            f.allocator.allocate(second).await.unwrap(),
            AllocationOutcome::Queued { .. }
        ));
    }

    #[tokio::test]
    async fn release_completes_and_idles_worker() {
        let f = fixture().await;
        let worker = make_worker(&f, "m1", &["claude_code"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;
        f.allocator.allocate(subtask_id).await.unwrap();

        let released = f
            .allocator
            .release(
                subtask_id,
                SubtaskOutcome::Completed {
                    output: serde_json::json!({"files_changed": 3}),
                },
            )
            .await
            .unwrap();

        assert_eq!(released.subtask.status, SubtaskStatus::Completed);
        assert!(released.worker_idle);
        assert_eq!(f.cache.in_progress_count().await.unwrap(), 0);

        let w = f.workers.get(worker).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn allocating_terminal_subtask_rejected() {
        let f = fixture().await;
        make_worker(&f, "m1", &["claude_code"]).await;
        let subtask_id = make_subtask(&f, Some("claude_code")).await;
        f.allocator.allocate(subtask_id).await.unwrap();
        f.allocator
            .release(
                subtask_id,
                SubtaskOutcome::Completed {
                    output: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        let err = f.allocator.allocate(subtask_id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn exploration_still_respects_invariants() {
        let f = fixture_with(EngineConfig {
            exploration_rate: 1.0,
            ..EngineConfig::default()
        })
        .await;
        make_worker(&f, "m1", &["claude_code"]).await;
        make_worker(&f, "m2", &["gemini_cli"]).await;

        // Every allocation explores, but each subtask still binds to a
        // qualified worker under the caps.
        for _ in 0..4 {
            let subtask_id = make_subtask(&f, Some("claude_code")).await;
            let outcome = f.allocator.allocate(subtask_id).await.unwrap();
            if let AllocationOutcome::Bound { subtask, .. } = outcome {
                assert!(subtask.assigned_tool.is_some());
                f.allocator
                    .release(
                        subtask.id,
                        SubtaskOutcome::Completed {
                            output: serde_json::json!({}),
                        },
                    )
                    .await
                    .unwrap();
            }
        }
        assert_eq!(f.subtasks.in_progress_count().await.unwrap(), 0);
    }
}
