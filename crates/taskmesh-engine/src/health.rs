//! Worker health checking and dead-worker failover.
//!
//! A periodic sweep finds workers whose heartbeat went stale, marks
//! them offline, and returns their in-progress subtasks to the pending
//! state: the database side in one transaction, then the cache's
//! atomic requeue per subtask, then a `worker_offline` event on each
//! affected task channel. A subtask is never observable as both
//! assigned and requeued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use taskmesh_kernel::{CacheService, EventBus, EventEnvelope, EventType};
use taskmesh_store::{SubtaskStatus, SubtaskStore, WorkerStatus, WorkerStore};

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// Result of one health sweep.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSweep {
    pub checked_at: DateTime<Utc>,
    pub stale_workers: Vec<Uuid>,
    pub subtasks_requeued: usize,
}

/// Non-mutating worker health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub heartbeat_timeout_secs: u64,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub stale_workers: Vec<Uuid>,
}

/// Background sweep that detects dead workers and requeues their work.
pub struct HealthChecker {
    workers: WorkerStore,
    subtasks: SubtaskStore,
    cache: CacheService,
    bus: EventBus,
    config: EngineConfig,
    shutdown: AtomicBool,
    notify: Notify,
}

impl HealthChecker {
    pub fn new(
        workers: WorkerStore,
        subtasks: SubtaskStore,
        cache: CacheService,
        bus: EventBus,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers,
            subtasks,
            cache,
            bus,
            config,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Spawn the periodic sweep loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                check_interval_secs = checker.config.health_check_interval.as_secs(),
                heartbeat_timeout_secs = checker.config.heartbeat_timeout.as_secs(),
                "worker health checker started"
            );
            loop {
                if checker.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = checker.run_once().await {
                    error!(%err, "worker health sweep failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(checker.config.health_check_interval) => {}
                    _ = checker.notify.notified() => {}
                }
            }
            info!("worker health checker stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// One sweep: fail over every worker whose heartbeat is stale.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> EngineResult<HealthSweep> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let stale = self.workers.stale_workers(cutoff).await?;

        let mut sweep = HealthSweep {
            checked_at: Utc::now(),
            stale_workers: Vec::with_capacity(stale.len()),
            subtasks_requeued: 0,
        };
        if stale.is_empty() {
            return Ok(sweep);
        }

        info!(count = stale.len(), "unresponsive workers detected");
        for worker in stale {
            warn!(
                worker_id = %worker.id,
                machine_name = %worker.machine_name,
                last_heartbeat = ?worker.last_heartbeat,
                "marking worker offline"
            );

            let orphans = self.workers.mark_offline_and_requeue(worker.id).await?;
            for subtask_id in &orphans {
                self.cache.requeue_atomic(*subtask_id).await?;
                self.cache
                    .set_status(
                        "subtask",
                        *subtask_id,
                        SubtaskStatus::Pending.as_str(),
                        self.config.status_mirror_ttl,
                    )
                    .await;

                if let Some(subtask) = self.subtasks.get(*subtask_id).await? {
                    self.bus
                        .publish(
                            subtask.task_id,
                            &EventEnvelope::new(
                                EventType::WorkerOffline,
                                serde_json::json!({
                                    "worker_id": worker.id,
                                    "subtask_id": subtask_id,
                                    "requeued": true,
                                }),
                            ),
                        )
                        .await?;
                }
            }

            self.cache
                .set_status(
                    "worker",
                    worker.id,
                    WorkerStatus::Offline.as_str(),
                    self.config.worker_mirror_ttl(),
                )
                .await;

            sweep.subtasks_requeued += orphans.len();
            sweep.stale_workers.push(worker.id);
        }

        Ok(sweep)
    }

    /// Immediate, non-mutating health report.
    #[instrument(skip(self))]
    pub async fn check_now(&self) -> EngineResult<HealthReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut active = 0;
        let mut stale = Vec::new();
        for worker in self.workers.list(None).await? {
            if !worker.status.expects_heartbeat() {
                continue;
            }
            active += 1;
            let is_stale = worker
                .last_heartbeat
                .map(|at| at < cutoff)
                .unwrap_or(true);
            if is_stale {
                stale.push(worker.id);
            }
        }

        Ok(HealthReport {
            checked_at: Utc::now(),
            heartbeat_timeout_secs: self.config.heartbeat_timeout.as_secs(),
            active_workers: active,
            healthy_workers: active - stale.len(),
            stale_workers: stale,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskmesh_kernel::{BreakerConfig, CircuitBreaker};
    use taskmesh_store::{
        Database, Heartbeat, NewSubtask, NewTask, SubtaskType, SystemInfo, TaskStore,
        WorkerRegistration,
    };

    struct Fixture {
        checker: Arc<HealthChecker>,
        tasks: TaskStore,
        subtasks: SubtaskStore,
        workers: WorkerStore,
        cache: CacheService,
        bus: EventBus,
    }

    async fn fixture(heartbeat_timeout: Duration) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let cache = CacheService::in_memory(CircuitBreaker::new("cache", BreakerConfig::cache()));
        let bus = EventBus::new(cache.clone(), Duration::from_secs(3600));
        let tasks = TaskStore::new(db.clone());
        let subtasks = SubtaskStore::new(db.clone());
        let workers = WorkerStore::new(db.clone());

        let config = EngineConfig {
            heartbeat_timeout,
            ..EngineConfig::default()
        };
        Fixture {
            checker: HealthChecker::new(
                workers.clone(),
                subtasks.clone(),
                cache.clone(),
                bus.clone(),
                config,
            ),
            tasks,
            subtasks,
            workers,
            cache,
            bus,
        }
    }

    async fn worker_with_subtask(f: &Fixture) -> (Uuid, Uuid, Uuid) {
        let worker = f
            .workers
            .register(WorkerRegistration {
                machine_id: "doomed".into(),
                machine_name: "doomed-box".into(),
                system_info: SystemInfo::default(),
                tools: vec!["claude_code".into()],
                on_prem: false,
            })
            .await
            .unwrap();

        let task = f
            .tasks
            .create(NewTask {
                description: "health checker fixture".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        let subtask = NewSubtask {
            id: Uuid::now_v7(),
            task_id: task.id,
            name: "Code Generation".into(),
            description: "work".into(),
            subtask_type: SubtaskType::CodeGeneration,
            dependencies: vec![],
            recommended_tool: None,
            complexity: 2,
            priority: 5,
        };
        let subtask_id = subtask.id;
        f.subtasks.create_batch(vec![subtask]).await.unwrap();
        f.subtasks
            .bind(subtask_id, worker.id, None, 1, 20)
            .await
            .unwrap();
        f.cache.mark_in_progress(subtask_id).await.unwrap();

        (worker.id, task.id, subtask_id)
    }

    #[tokio::test]
    async fn fresh_worker_untouched() {
        let f = fixture(Duration::from_secs(120)).await;
        let (worker_id, _, _) = worker_with_subtask(&f).await;

        let sweep = f.checker.run_once().await.unwrap();
        assert!(sweep.stale_workers.is_empty());

        let worker = f.workers.get(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn dead_worker_failed_over() {
        // Zero timeout: every heartbeat is immediately stale.
        let f = fixture(Duration::ZERO).await;
        let (worker_id, task_id, subtask_id) = worker_with_subtask(&f).await;
        let mut rx = f.bus.subscribe(task_id).await.unwrap();

        let sweep = f.checker.run_once().await.unwrap();
        assert_eq!(sweep.stale_workers, vec![worker_id]);
        assert_eq!(sweep.subtasks_requeued, 1);

        // Worker offline, subtask pending and unassigned.
        let worker = f.workers.get(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        let subtask = f.subtasks.get(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert!(subtask.assigned_worker.is_none());
        assert!(subtask.started_at.is_none());

        // Cache: out of in-progress, back on the queue.
        assert_eq!(f.cache.in_progress_count().await.unwrap(), 0);
        assert_eq!(f.cache.queue_len().await.unwrap(), 1);

        // The task channel saw the failover.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::WorkerOffline);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let f = fixture(Duration::ZERO).await;
        worker_with_subtask(&f).await;

        let first = f.checker.run_once().await.unwrap();
        assert_eq!(first.stale_workers.len(), 1);

        // Offline workers are no longer candidates.
        let second = f.checker.run_once().await.unwrap();
        assert!(second.stale_workers.is_empty());
        assert_eq!(f.cache.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn check_now_reports_without_mutating() {
        let f = fixture(Duration::ZERO).await;
        let (worker_id, _, _) = worker_with_subtask(&f).await;

        let report = f.checker.check_now().await.unwrap();
        assert_eq!(report.active_workers, 1);
        assert_eq!(report.stale_workers, vec![worker_id]);
        assert_eq!(report.healthy_workers, 0);

        // Report only: the worker was not failed over.
        let worker = f.workers.get(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn loop_runs_and_stops() {
        let f = fixture(Duration::ZERO).await;
        worker_with_subtask(&f).await;

        let checker = Arc::clone(&f.checker);
        let handle = checker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        checker.stop();
        handle.await.unwrap();

        assert_eq!(f.cache.queue_len().await.unwrap(), 1);
    }
}
