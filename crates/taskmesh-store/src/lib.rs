//! # taskmesh-store
//!
//! Storage engine for taskmesh.
//!
//! SQLite-backed persistence (WAL mode, async via the blocking pool)
//! for the orchestration data model: tasks and their subtask DAGs,
//! workers, checkpoints, evaluations, corrections, and the workflow
//! template registry. Every mutable entity carries a `version` column;
//! stale writes fail with [`StoreError::VersionConflict`] instead of
//! losing updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  TaskStore      SubtaskStore    WorkerStore  │
//! │  CheckpointStore  EvaluationStore            │
//! │  TemplateStore                               │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)     │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The allocation-critical writes ([`SubtaskStore::bind`],
//! [`SubtaskStore::release`], and
//! [`WorkerStore::mark_offline_and_requeue`]) each run as a single
//! transaction with their invariant re-checks inside, so SQLite's
//! writer lock provides the atomicity the engine's concurrency model
//! relies on.

pub mod checkpoint_store;
pub mod db;
pub mod error;
pub mod evaluation_store;
pub mod migration;
pub mod subtask_store;
pub mod task_store;
pub mod template_store;
pub mod types;
pub mod worker_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use checkpoint_store::{CheckpointStore, RollbackReport};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use evaluation_store::{EvaluationStore, ScoreWeights};
pub use subtask_store::{ReleaseResult, SubtaskOutcome, SubtaskStore, TaskProgress};
pub use task_store::TaskStore;
pub use template_store::{NewTemplateStep, TemplateStep, TemplateStore, WorkflowTemplate};
pub use worker_store::WorkerStore;
pub use types::{
    Checkpoint, CheckpointFrequency, CheckpointStatus, Correction, CorrectionResult, Evaluation,
    EvaluationScores, Heartbeat, NewSubtask, NewTask, PrivacyLevel, Subtask, SubtaskStatus,
    SubtaskType, SystemInfo, Task, TaskStatus, TaskType, TriggerReason, UserDecision, Worker,
    WorkerRegistration, WorkerStatus,
};
