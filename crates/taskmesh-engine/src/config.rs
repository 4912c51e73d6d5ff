//! Engine configuration.
//!
//! Every knob loads from `TASKMESH_*` environment variables with the
//! documented defaults, validated once at startup. There is no global
//! settings singleton: `main` builds one [`EngineConfig`] and hands it
//! to each component.

use std::time::Duration;

use taskmesh_store::ScoreWeights;

use crate::error::{EngineError, EngineResult};

/// All engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Concurrency caps.
    pub max_concurrent_subtasks: i64,
    pub max_subtasks_per_worker: i64,

    // Scheduler loop.
    pub scheduler_interval: Duration,
    /// Subtracted from the interval to form the per-cycle time budget.
    pub scheduler_grace: Duration,
    pub allocation_batch_size: usize,
    pub max_queue_allocation_attempts: usize,

    // Worker health.
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub health_check_interval: Duration,

    // Allocation scoring.
    pub tool_weight: f64,
    pub resource_weight: f64,
    pub privacy_weight: f64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    pub exploration_rate: f64,

    // Checkpoint trigger.
    pub evaluation_threshold: f64,
    pub subtask_completion_interval: i64,
    pub max_correction_cycles: i64,
    pub task_timeout: Duration,
    pub enable_error_trigger: bool,
    pub enable_evaluation_trigger: bool,
    pub enable_periodic_trigger: bool,
    pub enable_timeout_trigger: bool,

    // Evaluation scoring.
    pub score_weights: ScoreWeights,

    // Cache TTLs.
    pub status_mirror_ttl: Duration,
    pub mailbox_ttl: Duration,

    // Edge limits.
    pub max_ws_connections: usize,
    pub rate_limit_per_minute: u32,

    // Deployment.
    pub environment: String,
    pub secret_key: Option<String>,
    pub database_path: String,
    pub cors_origins: Vec<String>,
    pub bind_address: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subtasks: 20,
            max_subtasks_per_worker: 1,
            scheduler_interval: Duration::from_secs(30),
            scheduler_grace: Duration::from_secs(5),
            allocation_batch_size: 50,
            max_queue_allocation_attempts: 100,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(30),
            tool_weight: 0.50,
            resource_weight: 0.30,
            privacy_weight: 0.20,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            exploration_rate: 0.1,
            evaluation_threshold: 7.0,
            subtask_completion_interval: 5,
            max_correction_cycles: 3,
            task_timeout: Duration::from_secs(24 * 3600),
            enable_error_trigger: true,
            enable_evaluation_trigger: true,
            enable_periodic_trigger: true,
            enable_timeout_trigger: true,
            score_weights: ScoreWeights::default(),
            status_mirror_ttl: Duration::from_secs(60),
            mailbox_ttl: Duration::from_secs(3600),
            max_ws_connections: 50,
            rate_limit_per_minute: 120,
            environment: "development".into(),
            secret_key: None,
            database_path: "data/taskmesh.db".into(),
            cors_origins: vec![
                "http://localhost:3000".into(),
                "http://127.0.0.1:3000".into(),
            ],
            bind_address: "127.0.0.1:8000".into(),
        }
    }
}

impl EngineConfig {
    /// Build from `TASKMESH_*` environment variables, falling back to
    /// defaults, then validate.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        config.max_concurrent_subtasks =
            env_parse("TASKMESH_MAX_CONCURRENT_SUBTASKS", config.max_concurrent_subtasks)?;
        config.max_subtasks_per_worker =
            env_parse("TASKMESH_MAX_SUBTASKS_PER_WORKER", config.max_subtasks_per_worker)?;
        config.scheduler_interval = Duration::from_secs(env_parse(
            "TASKMESH_SCHEDULER_INTERVAL_SECONDS",
            config.scheduler_interval.as_secs(),
        )?);
        config.allocation_batch_size =
            env_parse("TASKMESH_ALLOCATION_BATCH_SIZE", config.allocation_batch_size)?;
        config.max_queue_allocation_attempts = env_parse(
            "TASKMESH_MAX_QUEUE_ALLOCATION_ATTEMPTS",
            config.max_queue_allocation_attempts,
        )?;
        config.heartbeat_interval = Duration::from_secs(env_parse(
            "TASKMESH_HEARTBEAT_INTERVAL_SECONDS",
            config.heartbeat_interval.as_secs(),
        )?);
        config.heartbeat_timeout = Duration::from_secs(env_parse(
            "TASKMESH_HEARTBEAT_TIMEOUT_SECONDS",
            config.heartbeat_timeout.as_secs(),
        )?);
        config.health_check_interval = Duration::from_secs(env_parse(
            "TASKMESH_HEALTH_CHECK_INTERVAL_SECONDS",
            config.health_check_interval.as_secs(),
        )?);
        config.evaluation_threshold =
            env_parse("TASKMESH_EVALUATION_THRESHOLD", config.evaluation_threshold)?;
        config.subtask_completion_interval = env_parse(
            "TASKMESH_SUBTASK_COMPLETION_INTERVAL",
            config.subtask_completion_interval,
        )?;
        config.max_correction_cycles =
            env_parse("TASKMESH_MAX_CORRECTION_CYCLES", config.max_correction_cycles)?;
        config.task_timeout = Duration::from_secs(
            env_parse(
                "TASKMESH_TASK_TIMEOUT_HOURS",
                config.task_timeout.as_secs() / 3600,
            )? * 3600,
        );
        config.exploration_rate =
            env_parse("TASKMESH_EXPLORATION_RATE", config.exploration_rate)?;
        config.rate_limit_per_minute =
            env_parse("TASKMESH_RATE_LIMIT_PER_MINUTE", config.rate_limit_per_minute)?;
        config.max_ws_connections =
            env_parse("TASKMESH_MAX_WS_CONNECTIONS", config.max_ws_connections)?;

        if let Ok(value) = std::env::var("TASKMESH_ENVIRONMENT") {
            config.environment = value;
        }
        if let Ok(value) = std::env::var("TASKMESH_SECRET_KEY") {
            config.secret_key = Some(value);
        }
        if let Ok(value) = std::env::var("TASKMESH_DATABASE_PATH") {
            config.database_path = value;
        }
        if let Ok(value) = std::env::var("TASKMESH_BIND_ADDRESS") {
            config.bind_address = value;
        }
        if let Ok(value) = std::env::var("TASKMESH_CORS_ORIGINS") {
            config.cors_origins = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent or insecure configurations.
    pub fn validate(&self) -> EngineResult<()> {
        let weight_sum = self.tool_weight + self.resource_weight + self.privacy_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::Validation {
                message: format!("allocation weights must sum to 1.0 (got {weight_sum})"),
            });
        }
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(EngineError::Validation {
                message: format!(
                    "exploration rate must be in [0, 1] (got {})",
                    self.exploration_rate
                ),
            });
        }
        if self.max_concurrent_subtasks < 1 || self.max_subtasks_per_worker < 1 {
            return Err(EngineError::Validation {
                message: "concurrency caps must be at least 1".into(),
            });
        }
        if self.cors_origins.iter().any(|origin| origin == "*") {
            return Err(EngineError::Validation {
                message: "CORS origins must be an explicit list, never *".into(),
            });
        }

        let production = matches!(self.environment.as_str(), "production" | "staging");
        match &self.secret_key {
            Some(key) if key.len() < 32 => {
                if production {
                    return Err(EngineError::Validation {
                        message: format!(
                            "secret key must be at least 32 bytes (got {})",
                            key.len()
                        ),
                    });
                }
                tracing::warn!(
                    length = key.len(),
                    "secret key shorter than 32 bytes; rejected outside development"
                );
            }
            None if production => {
                return Err(EngineError::Validation {
                    message: "TASKMESH_SECRET_KEY is required in production/staging".into(),
                });
            }
            _ => {}
        }

        Ok(())
    }

    /// Worker status mirrors live twice the heartbeat interval.
    pub fn worker_mirror_ttl(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Per-cycle time budget for the scheduler.
    pub fn cycle_budget(&self) -> Duration {
        self.scheduler_interval
            .saturating_sub(self.scheduler_grace)
            .max(Duration::from_secs(1))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> EngineResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| EngineError::Validation {
            message: format!("cannot parse {name}={raw}"),
        }),
        Err(_) => Ok(default),
    }
}

// ── tests ────────────────────────────────────────────────────────────
