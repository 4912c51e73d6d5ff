//! The scheduling loop.
//!
//! One pass discovers ready work across active tasks, allocates within
//! the global capacity, then drains the reallocation queue. The loop
//! wakes on a timer and on subtask completions; each cycle runs under a
//! time budget of the interval minus a grace period so a stalled
//! dependency cannot make cycles pile up.
//!
//! The in-progress count from the database is authoritative; the cache
//! counter is only cross-checked and logged on divergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use taskmesh_kernel::{CacheService, EventBus, EventEnvelope, EventType, Metrics};
use taskmesh_store::{
    Subtask, SubtaskOutcome, SubtaskStore, Task, TaskStatus, TaskStore,
};

use crate::allocator::{AllocationOutcome, AllocationStats, Allocator};
use crate::checkpoint::{CheckpointTrigger, TriggerContext};
use crate::config::EngineConfig;
use crate::decomposer::Decomposer;
use crate::error::{EngineError, EngineResult};

/// Summary of one scheduler pass.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_start: DateTime<Utc>,
    pub duration_ms: u64,
    pub tasks_processed: usize,
    pub subtasks_allocated: usize,
    pub subtasks_queued: usize,
    pub errors: Vec<String>,
}

/// Counters across the scheduler's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub cycles_run: u64,
    pub total_allocated: u64,
    pub total_queued: u64,
    pub last_cycle: Option<CycleReport>,
}

/// Combined view for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub stats: SchedulerStats,
    pub allocation: AllocationStats,
}

/// Capacity-bounded discovery and allocation loop.
pub struct Scheduler {
    tasks: TaskStore,
    subtasks: SubtaskStore,
    allocator: Allocator,
    decomposer: Decomposer,
    trigger: CheckpointTrigger,
    cache: CacheService,
    bus: EventBus,
    metrics: Metrics,
    config: EngineConfig,
    notify: Notify,
    shutdown: AtomicBool,
    running: AtomicBool,
    stats: Mutex<SchedulerStats>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: TaskStore,
        subtasks: SubtaskStore,
        allocator: Allocator,
        decomposer: Decomposer,
        trigger: CheckpointTrigger,
        cache: CacheService,
        bus: EventBus,
        metrics: Metrics,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            subtasks,
            allocator,
            decomposer,
            trigger,
            cache,
            bus,
            metrics,
            config,
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStats::default()),
        })
    }

    /// Spawn the periodic loop. Wakes early on [`Scheduler::wake`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        scheduler.running.store(true, Ordering::Release);
        tokio::spawn(async move {
            info!(
                interval_secs = scheduler.config.scheduler_interval.as_secs(),
                "scheduler loop started"
            );
            loop {
                if scheduler.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = scheduler.run_cycle().await {
                    error!(%err, "scheduler cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(scheduler.config.scheduler_interval) => {}
                    _ = scheduler.notify.notified() => {}
                }
            }
            scheduler.running.store(false, Ordering::Release);
            info!("scheduler loop stopped");
        })
    }

    /// Ask the loop to exit after the current cycle.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Wake the loop ahead of its timer (subtask completion, new work).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Run one scheduling pass under the cycle time budget.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let cycle_start = Utc::now();
        let started = std::time::Instant::now();
        let mut report = CycleReport {
            cycle_start,
            duration_ms: 0,
            tasks_processed: 0,
            subtasks_allocated: 0,
            subtasks_queued: 0,
            errors: Vec::new(),
        };

        match tokio::time::timeout(self.config.cycle_budget(), self.cycle_inner(&mut report)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => report.errors.push(err.to_string()),
            Err(_) => {
                warn!("scheduler cycle exceeded its time budget");
                report.errors.push(
                    EngineError::Timeout {
                        message: "scheduler cycle budget exceeded".into(),
                    }
                    .to_string(),
                );
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .observe("taskmesh_scheduler_cycle_seconds", &[], started.elapsed().as_secs_f64());
        self.metrics.inc_by(
            "taskmesh_subtasks_allocated_total",
            &[],
            report.subtasks_allocated as u64,
        );

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.cycles_run += 1;
        stats.total_allocated += report.subtasks_allocated as u64;
        stats.total_queued += report.subtasks_queued as u64;
        stats.last_cycle = Some(report.clone());
        drop(stats);

        debug!(
            tasks = report.tasks_processed,
            allocated = report.subtasks_allocated,
            queued = report.subtasks_queued,
            errors = report.errors.len(),
            "scheduler cycle finished"
        );
        Ok(report)
    }

    async fn cycle_inner(&self, report: &mut CycleReport) -> EngineResult<()> {
        // Authoritative capacity from the database, cross-checked
        // against the cache's advisory counter.
        let in_progress = self.subtasks.in_progress_count().await?;
        if let Ok(mirrored) = self.cache.in_progress_count().await {
            if mirrored as i64 != in_progress {
                warn!(
                    db = in_progress,
                    cache = mirrored,
                    "in-progress counters diverge; trusting the database"
                );
            }
        }
        let mut capacity = self.config.max_concurrent_subtasks - in_progress;

        let active = self.tasks.active_tasks().await?;
        for task in &active {
            if capacity <= 0 {
                break;
            }
            report.tasks_processed += 1;
            match self.schedule_task(task, &mut capacity, report).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(task_id = %task.id, %err, "task scheduling failed");
                    report.errors.push(format!("task {}: {err}", task.id));
                }
            }
        }

        // Periodic timeout sweep for the checkpoint trigger.
        for task in &active {
            if let Err(err) = self
                .trigger
                .check_and_trigger(task.id, TriggerContext::default())
                .await
            {
                report.errors.push(format!("trigger {}: {err}", task.id));
            }
        }

        self.drain_queue(&mut capacity, report).await;
        Ok(())
    }

    async fn schedule_task(
        &self,
        task: &Task,
        capacity: &mut i64,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let ready = self.subtasks.ready_subtasks(task.id).await?;
        for subtask in ready {
            if *capacity <= 0 {
                break;
            }
            match self.allocator.allocate(subtask.id).await {
                Ok(AllocationOutcome::Bound { .. }) => {
                    report.subtasks_allocated += 1;
                    *capacity -= 1;
                }
                Ok(AllocationOutcome::Queued { .. }) => {
                    report.subtasks_queued += 1;
                }
                Err(err) => {
                    report.errors.push(format!("subtask {}: {err}", subtask.id));
                }
            }
        }
        Ok(())
    }

    /// Attempt to allocate from the reallocation queue, bounded by the
    /// per-cycle attempt and batch limits. Stops after one full lap:
    /// popping an id already tried this drain means everything left is
    /// unallocatable right now.
    async fn drain_queue(&self, capacity: &mut i64, report: &mut CycleReport) {
        let mut attempts = 0;
        let mut batch = 0;
        let mut seen = std::collections::HashSet::new();

        while *capacity > 0
            && attempts < self.config.max_queue_allocation_attempts
            && batch < self.config.allocation_batch_size
        {
            attempts += 1;
            let popped = match self.cache.queue_pop().await {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(err) => {
                    report.errors.push(format!("queue: {err}"));
                    break;
                }
            };
            if !seen.insert(popped) {
                if let Err(err) = self.cache.queue_push(popped).await {
                    report.errors.push(format!("queue: {err}"));
                }
                break;
            }

            match self.allocator.allocate(popped).await {
                Ok(AllocationOutcome::Bound { .. }) => {
                    report.subtasks_allocated += 1;
                    batch += 1;
                    *capacity -= 1;
                }
                Ok(AllocationOutcome::Queued { .. }) => {
                    // Still unallocatable; the allocator put it back at
                    // the tail.
                    debug!(subtask_id = %popped, "queued subtask remains unallocatable");
                }
                Err(EngineError::InvalidState { .. }) | Err(EngineError::NotFound { .. }) => {
                    // A cancelled or already-finished subtask left on
                    // the queue; drop it.
                    debug!(subtask_id = %popped, "dropping stale queue entry");
                }
                Err(err) => {
                    report.errors.push(format!("subtask {popped}: {err}"));
                }
            }
        }
    }

    /// Ingest a worker-reported subtask outcome: release the binding,
    /// recompute task state, consult the checkpoint trigger, and wake
    /// the loop for follow-on work.
    #[instrument(skip(self, outcome))]
    pub async fn handle_subtask_result(
        &self,
        subtask_id: Uuid,
        outcome: SubtaskOutcome,
    ) -> EngineResult<Subtask> {
        let released = self.allocator.release(subtask_id, outcome).await?;
        let subtask = released.subtask;
        let failed = subtask.error.is_some();

        self.metrics.inc(
            "taskmesh_subtasks_total",
            &[("status", subtask.status.as_str())],
        );
        if let Some(tool) = subtask.assigned_tool.as_deref() {
            self.metrics
                .inc("taskmesh_subtasks_by_tool_total", &[("tool", tool)]);
        }

        // A finished fix settles the correction cycle before progress
        // is recomputed.
        if subtask.subtask_type == taskmesh_store::SubtaskType::CodeFix {
            self.trigger
                .apply_fix_result(subtask.task_id, !failed)
                .await?;
        }

        let terminal = self
            .decomposer
            .check_task_completion(subtask.task_id)
            .await?;
        if terminal.is_none() {
            self.trigger
                .check_and_trigger(
                    subtask.task_id,
                    TriggerContext {
                        error_occurred: failed,
                        completed_subtask: (!failed).then_some(subtask.id),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.wake();
        Ok(subtask)
    }

    /// Cancel a task: terminal immediately, subtasks cancelled, queue
    /// and in-progress mirrors cleared, event published.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: Uuid) -> EngineResult<Task> {
        let task = self
            .tasks
            .update_status(
                task_id,
                &[
                    TaskStatus::Pending,
                    TaskStatus::Initializing,
                    TaskStatus::InProgress,
                    TaskStatus::Checkpoint,
                ],
                TaskStatus::Cancelled,
                None,
            )
            .await?;

        let live = self.subtasks.cancel_for_task(task_id).await?;
        for subtask_id in &live {
            if let Err(err) = self.cache.remove_live(*subtask_id).await {
                warn!(subtask_id = %subtask_id, %err, "cache cleanup failed on cancel");
            }
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
                    serde_json::json!({"task_id": task_id, "live_subtasks_cleared": live.len()}),
                ),
            )
            .await?;

        info!(task_id = %task_id, "task cancelled");
        Ok(task)
    }

    /// Snapshot for `/scheduler/stats`.
    pub async fn status(&self) -> EngineResult<SchedulerStatus> {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(SchedulerStatus {
            running: self.running.load(Ordering::Acquire),
            stats,
            allocation: self.allocator.allocation_stats().await?,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
