//! taskmesh infrastructure services.
//!
//! This crate provides the shared-infrastructure layer the orchestration
//! engine composes over:
//!
//! - **[`breaker`]** -- Per-dependency circuit breakers
//!   (closed/open/half-open) with a named registry.
//! - **[`cache`]** -- The cache/queue adapter: status mirrors with TTL,
//!   the global pending queue + in-progress set, pub/sub channels,
//!   per-client mailboxes, and fixed-window rate limiting, behind a
//!   [`cache::CacheBackend`] seam and wrapped by the cache breaker.
//! - **[`bus`]** -- Per-task event fan-out with refcounted channel
//!   subscriptions and mailbox bridging for brief disconnects.
//! - **[`pool`]** -- Pool utilization monitoring and the backpressure
//!   admission gate.
//! - **[`metrics`]** -- In-process counters/gauges/histograms with text
//!   exposition rendering.
//!
//! All public types are `Send + Sync` and designed for a multi-threaded
//! tokio runtime.

pub mod breaker;
pub mod bus;
pub mod cache;
pub mod error;
pub mod metrics;
pub mod pool;

// Re-export the most commonly used types at the crate root.
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState};
pub use bus::{EventBus, EventEnvelope, EventType};
pub use cache::{CacheBackend, CacheService, ChannelMessage, MemoryBackend, RateLimitDecision};
pub use error::{KernelError, KernelResult};
pub use metrics::Metrics;
pub use pool::{
    AdmissionGate, PoolHealthReport, PoolMetrics, PoolMonitor, PoolSample, PoolSampler,
    PoolThresholds,
};
