//! Circuit breakers for external dependencies.
//!
//! Each shared dependency (cache, database, external egress) gets an
//! independently configured breaker with the usual three states:
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(recovery_timeout elapsed)---------------> HalfOpen
//! HalfOpen --(success_threshold consecutive successes)--> Closed
//! HalfOpen --(any failure)--------------------------> Open
//! ```
//!
//! While open, [`CircuitBreaker::check`] fails fast with the time until
//! the next recovery probe. Half-open admits at most
//! `half_open_max_calls` concurrent probes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::{KernelError, KernelResult};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning knobs for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Concurrent calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    /// Profile for the shared cache: trip fast, probe soon.
    pub fn cache() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(15),
            success_threshold: 2,
            half_open_max_calls: 1,
        }
    }

    /// Profile for the database: more tolerant, slower probing.
    pub fn database() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_calls: 1,
        }
    }

    /// Profile for external HTTP egress.
    pub fn external() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time snapshot of breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Seconds until an open breaker admits a probe; 0 otherwise.
    pub time_until_recovery_secs: f64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

/// A single fault-isolation state machine.
///
/// Cheaply cloneable (`Arc`-backed); the counters live under one
/// `Mutex` so state transitions observe a consistent view.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into().into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_failures: 0,
                total_successes: 0,
                last_failure: None,
                half_open_in_flight: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission check before calling the protected dependency.
    ///
    /// Fails fast with [`KernelError::BreakerOpen`] while open, and
    /// transitions open → half-open once the recovery timeout elapses.
    /// Every `Ok(())` must be balanced by [`CircuitBreaker::record_success`]
    /// or [`CircuitBreaker::record_failure`].
    pub fn check(&self) -> KernelResult<()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = self.time_remaining(&inner);
                if remaining > Duration::ZERO {
                    return Err(KernelError::BreakerOpen {
                        name: self.name.to_string(),
                        retry_after_secs: remaining.as_secs_f64(),
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_in_flight = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(KernelError::BreakerOpen {
                        name: self.name.to_string(),
                        retry_after_secs: self.time_remaining(&inner).as_secs_f64(),
                    });
                }
                inner.half_open_in_flight += 1;
                Ok(())
            }
        }
    }

    /// Record a successful call to the protected dependency.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    /// Record a failed call to the protected dependency.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());

        tracing::warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            "breaker recorded failure"
        );

        match inner.state {
            // Any half-open failure reopens immediately.
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            time_until_recovery_secs: if inner.state == CircuitState::Open {
                self.time_remaining(&inner).as_secs_f64()
            } else {
                0.0
            },
        }
    }

    /// Force the breaker back to closed with fresh counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker lock means a panic mid-bookkeeping; the
        // counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn time_remaining(&self, inner: &BreakerInner) -> Duration {
        match inner.last_failure {
            Some(at) => self.config.recovery_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        tracing::info!(breaker = %self.name, ?from, ?to, "breaker state changed");
    }
}

// ── registry ─────────────────────────────────────────────────────────

/// Named breakers for every external dependency, created on demand.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `name`, creating it with `config` on first
    /// use. The config of an existing breaker is left untouched.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Stats for every registered breaker.
    pub fn all_stats(&self) -> Vec<(String, BreakerStats)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
