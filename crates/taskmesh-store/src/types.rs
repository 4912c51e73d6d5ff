//! Domain entity types.
//!
//! Every entity that lives in SQLite is defined here together with its
//! status enums. Enums are stored as their snake_case string form; the
//! `parse` constructors surface unknown database values as
//! [`StoreError::UnknownEnumValue`] instead of panicking, so a schema
//! from a newer build degrades into an explicit error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Convert a unix-seconds column into a UTC timestamp.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

/// Convert an optional unix-seconds column.
pub(crate) fn from_unix_opt(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(from_unix)
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// The stable string form stored in the database and wire payloads.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Parse the stored string form.
            pub fn parse(value: &str) -> StoreResult<Self> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::UnknownEnumValue {
                        what: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── enums ────────────────────────────────────────────────────────────

string_enum! {
    /// Kind of work a task represents; selects the decomposition template.
    TaskType {
        DevelopFeature => "develop_feature",
        BugFix => "bug_fix",
        Refactor => "refactor",
        CodeReview => "code_review",
        Documentation => "documentation",
        Testing => "testing",
    }
}

string_enum! {
    /// Task lifecycle state.
    TaskStatus {
        Pending => "pending",
        Initializing => "initializing",
        InProgress => "in_progress",
        Checkpoint => "checkpoint",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States the scheduler considers when looking for ready work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::InProgress | Self::Checkpoint)
    }
}

string_enum! {
    /// Kind of work a single subtask performs.
    SubtaskType {
        CodeGeneration => "code_generation",
        CodeReview => "code_review",
        CodeFix => "code_fix",
        Test => "test",
        Documentation => "documentation",
        Analysis => "analysis",
        Deployment => "deployment",
    }
}

string_enum! {
    /// Subtask lifecycle state.
    SubtaskStatus {
        Pending => "pending",
        Queued => "queued",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        Correcting => "correcting",
    }
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Live states count against the global concurrency cap.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

string_enum! {
    /// Worker availability state.
    WorkerStatus {
        Online => "online",
        Offline => "offline",
        Busy => "busy",
        Idle => "idle",
    }
}

impl WorkerStatus {
    /// Whether the worker should be sending heartbeats.
    pub fn expects_heartbeat(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

string_enum! {
    /// How eagerly the checkpoint trigger pauses a task for review.
    CheckpointFrequency {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

string_enum! {
    /// Data-sensitivity hint used by allocation scoring.
    PrivacyLevel {
        Normal => "normal",
        Sensitive => "sensitive",
    }
}

string_enum! {
    /// Why a checkpoint was created.
    TriggerReason {
        CodeGenerationComplete => "code_generation_complete",
        ReviewIssuesFound => "review_issues_found",
        LowEvaluationScore => "low_evaluation_score",
        Periodic => "periodic",
        Manual => "manual",
        Timeout => "timeout",
    }
}

string_enum! {
    /// Review state of a checkpoint.
    CheckpointStatus {
        PendingReview => "pending_review",
        Approved => "approved",
        Rejected => "rejected",
        Corrected => "corrected",
    }
}

string_enum! {
    /// Human verdict on a checkpoint.
    UserDecision {
        Accept => "accept",
        Correct => "correct",
        Reject => "reject",
    }
}

string_enum! {
    /// Outcome of an individual correction.
    CorrectionResult {
        Pending => "pending",
        Applied => "applied",
        Failed => "failed",
    }
}

// ── entities ─────────────────────────────────────────────────────────

/// A user-submitted unit of work, expanded into a DAG of subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// 0–100, derived from completed subtasks.
    pub progress: i32,
    /// Higher runs earlier in a scheduler cycle.
    pub priority: i32,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy_level: PrivacyLevel,
    /// Ordered tool names the submitter prefers.
    pub tool_preferences: Vec<String>,
    /// Opaque to the engine.
    pub metadata: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub description: String,
    pub task_type: TaskType,
    pub priority: i32,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy_level: PrivacyLevel,
    pub tool_preferences: Vec<String>,
    pub metadata: serde_json::Value,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            description: String::new(),
            task_type: TaskType::DevelopFeature,
            priority: 0,
            checkpoint_frequency: CheckpointFrequency::Medium,
            privacy_level: PrivacyLevel::Normal,
            tool_preferences: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }
}

/// One node in a task's DAG, executed by exactly one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub subtask_type: SubtaskType,
    pub status: SubtaskStatus,
    pub progress: i32,
    /// Sibling subtask ids that must complete before this one starts.
    pub dependencies: Vec<Uuid>,
    pub recommended_tool: Option<String>,
    pub assigned_worker: Option<Uuid>,
    pub assigned_tool: Option<String>,
    /// 1–5; feeds execution-timeout multipliers.
    pub complexity: i32,
    pub priority: i32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for inserting one subtask during decomposition.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub subtask_type: SubtaskType,
    pub dependencies: Vec<Uuid>,
    pub recommended_tool: Option<String>,
    pub complexity: i32,
    pub priority: i32,
}

/// Machine capacity reported at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub disk_gb: f64,
}

/// A remote agent with a known machine identity and tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    /// Physical machine identity; registration is idempotent on this.
    pub machine_id: String,
    pub machine_name: String,
    pub status: WorkerStatus,
    pub system_info: SystemInfo,
    pub tools: Vec<String>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Flagged workers satisfy sensitive-task privacy scoring.
    pub on_prem: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub machine_id: String,
    pub machine_name: String,
    pub system_info: SystemInfo,
    pub tools: Vec<String>,
    pub on_prem: bool,
}

/// Heartbeat payload.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub status: WorkerStatus,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// A paused-for-human-review point in a task's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub trigger_reason: TriggerReason,
    pub status: CheckpointStatus,
    /// Subtask ids completed at the time the checkpoint was taken.
    pub subtasks_completed: Vec<Uuid>,
    pub user_decision: Option<UserDecision>,
    pub user_feedback: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Numeric multidimensional quality verdict on a subtask.
///
/// Dimensions are in `[0, 10]`; any may be absent when an evaluator did
/// not run. `overall_score` is the weighted mean over present values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub subtask_id: Uuid,
    pub code_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub security: Option<f64>,
    pub architecture: Option<f64>,
    pub testability: Option<f64>,
    pub overall_score: f64,
    pub details: serde_json::Value,
    pub evaluated_at: DateTime<Utc>,
}

/// The raw dimension scores handed in by an evaluator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvaluationScores {
    pub code_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub security: Option<f64>,
    pub architecture: Option<f64>,
    pub testability: Option<f64>,
}

/// A child fix created to address checkpoint feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: Uuid,
    pub checkpoint_id: Uuid,
    pub subtask_id: Uuid,
    pub correction_type: String,
    pub description: String,
    pub result: CorrectionResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── tests ────────────────────────────────────────────────────────────
