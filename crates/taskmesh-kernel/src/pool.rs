//! Connection-pool monitoring and admission control.
//!
//! A [`PoolMonitor`] periodically samples every registered
//! [`PoolSampler`] (database pool, cache client pool), derives
//! utilization, and maintains one cached boolean the hot path cares
//! about: is backpressure active? The cached decision refreshes at most
//! once per cooldown period so a pool oscillating around the threshold
//! does not flap admission on and off.
//!
//! [`AdmissionGate`] turns that signal into request shedding: enforcing
//! for writes, advisory for reads, exempt for health/metrics (the edge
//! decides which paths ask).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{KernelError, KernelResult};

/// A raw utilization reading from one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSample {
    pub in_use: u64,
    pub capacity: u64,
}

/// Anything that can report its current pool usage.
pub trait PoolSampler: Send + Sync {
    fn name(&self) -> &'static str;
    fn sample(&self) -> PoolSample;
}

/// Derived metrics snapshot for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_name: &'static str,
    pub in_use: u64,
    pub capacity: u64,
    pub utilization_percent: f64,
    pub available_connections: u64,
    pub is_healthy: bool,
    pub warning: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

/// Utilization thresholds, in percent.
#[derive(Debug, Clone, Copy)]
pub struct PoolThresholds {
    pub warning: f64,
    pub critical: f64,
    pub backpressure_on: f64,
    /// Minimum time between backpressure re-evaluations.
    pub cooldown: Duration,
}

impl Default for PoolThresholds {
    fn default() -> Self {
        Self {
            warning: 70.0,
            critical: 90.0,
            backpressure_on: 85.0,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Aggregate health view across every pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealthReport {
    pub healthy: bool,
    pub backpressure_active: bool,
    pub pools: Vec<PoolMetrics>,
}

struct MonitorState {
    backpressure_active: bool,
    last_refresh: Option<Instant>,
    history: HashMap<&'static str, VecDeque<PoolMetrics>>,
}

const HISTORY_MAX: usize = 100;

/// Samples pools and caches the backpressure decision.
pub struct PoolMonitor {
    samplers: Vec<Arc<dyn PoolSampler>>,
    thresholds: PoolThresholds,
    state: Mutex<MonitorState>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl PoolMonitor {
    pub fn new(samplers: Vec<Arc<dyn PoolSampler>>, thresholds: PoolThresholds) -> Arc<Self> {
        Arc::new(Self {
            samplers,
            thresholds,
            state: Mutex::new(MonitorState {
                backpressure_active: false,
                last_refresh: None,
                history: HashMap::new(),
            }),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Take a fresh sample of every pool, record history, and update the
    /// cached backpressure decision.
    pub fn sample_all(&self) -> Vec<PoolMetrics> {
        let now = Utc::now();
        let mut snapshots = Vec::with_capacity(self.samplers.len());
        let mut worst = 0.0_f64;

        for sampler in &self.samplers {
            let raw = sampler.sample();
            let utilization = if raw.capacity > 0 {
                (raw.in_use as f64 / raw.capacity as f64) * 100.0
            } else {
                0.0
            };
            worst = worst.max(utilization);

            let mut metrics = PoolMetrics {
                pool_name: sampler.name(),
                in_use: raw.in_use,
                capacity: raw.capacity,
                utilization_percent: (utilization * 100.0).round() / 100.0,
                available_connections: raw.capacity.saturating_sub(raw.in_use),
                is_healthy: true,
                warning: None,
                sampled_at: now,
            };

            if utilization >= self.thresholds.critical {
                metrics.is_healthy = false;
                metrics.warning = Some(format!(
                    "pool {} at {utilization:.1}% utilization (critical)",
                    sampler.name()
                ));
                warn!(pool = sampler.name(), utilization, "pool critical");
            } else if utilization >= self.thresholds.warning {
                metrics.warning = Some(format!(
                    "pool {} at {utilization:.1}% utilization",
                    sampler.name()
                ));
                debug!(pool = sampler.name(), utilization, "pool above warning threshold");
            }

            snapshots.push(metrics);
        }

        let active = worst >= self.thresholds.backpressure_on;
        let mut state = self.lock();
        if state.backpressure_active != active {
            info!(
                active,
                worst_utilization = worst,
                "backpressure state changed"
            );
        }
        state.backpressure_active = active;
        state.last_refresh = Some(Instant::now());
        for metrics in &snapshots {
            let history = state.history.entry(metrics.pool_name).or_default();
            history.push_back(metrics.clone());
            while history.len() > HISTORY_MAX {
                history.pop_front();
            }
        }

        snapshots
    }

    /// The cached admission signal. Re-samples only when the cooldown
    /// has elapsed (or nothing was ever sampled).
    pub fn backpressure_active(&self) -> bool {
        let needs_refresh = {
            let state = self.lock();
            match state.last_refresh {
                Some(at) => at.elapsed() >= self.thresholds.cooldown,
                None => true,
            }
        };
        if needs_refresh {
            self.sample_all();
        }
        self.lock().backpressure_active
    }

    /// Full health view, freshly sampled.
    pub fn health(&self) -> PoolHealthReport {
        let pools = self.sample_all();
        PoolHealthReport {
            healthy: pools.iter().all(|p| p.is_healthy),
            backpressure_active: self.lock().backpressure_active,
            pools,
        }
    }

    /// Recent samples for one pool, newest last.
    pub fn history(&self, pool_name: &str, limit: usize) -> Vec<PoolMetrics> {
        let state = self.lock();
        state
            .history
            .get(pool_name)
            .map(|h| h.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest utilization across the latest sample of every pool.
    pub fn worst_utilization(&self) -> f64 {
        let state = self.lock();
        state
            .history
            .values()
            .filter_map(|h| h.back().map(|m| m.utilization_percent))
            .fold(0.0, f64::max)
    }

    /// Spawn the background sampling loop.
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "pool monitor started");
            loop {
                if monitor.shutdown.load(Ordering::Acquire) {
                    break;
                }
                monitor.sample_all();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = monitor.notify.notified() => {}
                }
            }
            info!("pool monitor stopped");
        })
    }

    /// Signal the sampling loop to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── admission ────────────────────────────────────────────────────────

/// Sheds inbound writes while pools are saturated.
#[derive(Clone)]
pub struct AdmissionGate {
    monitor: Arc<PoolMonitor>,
}

impl AdmissionGate {
    pub fn new(monitor: Arc<PoolMonitor>) -> Self {
        Self { monitor }
    }

    /// Enforcing check for write requests. Retryable failure while
    /// backpressure is active.
    pub fn check_write(&self) -> KernelResult<()> {
        if self.monitor.backpressure_active() {
            return Err(KernelError::Backpressure {
                utilization_percent: self.monitor.worst_utilization(),
            });
        }
        Ok(())
    }

    /// Advisory check for reads: reports the signal, never rejects.
    pub fn read_pressure(&self) -> bool {
        self.monitor.backpressure_active()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct StubSampler {
        name: &'static str,
        in_use: AtomicU64,
        capacity: u64,
    }

    impl StubSampler {
        fn new(name: &'static str, in_use: u64, capacity: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                in_use: AtomicU64::new(in_use),
                capacity,
            })
        }

        fn set_in_use(&self, value: u64) {
            self.in_use.store(value, Ordering::Relaxed);
        }
    }

    impl PoolSampler for StubSampler {
        fn name(&self) -> &'static str {
            self.name
        }

        fn sample(&self) -> PoolSample {
            PoolSample {
                in_use: self.in_use.load(Ordering::Relaxed),
                capacity: self.capacity,
            }
        }
    }

    fn thresholds(cooldown: Duration) -> PoolThresholds {
        PoolThresholds {
            cooldown,
            ..PoolThresholds::default()
        }
    }

    #[test]
    fn utilization_derivation() {
        let sampler = StubSampler::new("database", 7, 10);
        let monitor = PoolMonitor::new(vec![sampler], thresholds(Duration::ZERO));

        let metrics = monitor.sample_all();
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0].utilization_percent - 70.0).abs() < 0.01);
        assert_eq!(metrics[0].available_connections, 3);
        assert!(metrics[0].is_healthy);
        assert!(metrics[0].warning.is_some());
    }

    #[test]
    fn critical_marks_unhealthy() {
        let sampler = StubSampler::new("database", 19, 20);
        let monitor = PoolMonitor::new(vec![sampler], thresholds(Duration::ZERO));

        let report = monitor.health();
        assert!(!report.healthy);
        assert!(report.backpressure_active);
    }

    #[test]
    fn backpressure_tracks_worst_pool() {
        let db = StubSampler::new("database", 1, 10);
        let cache = StubSampler::new("cache", 9, 10);
        let monitor = PoolMonitor::new(
            vec![db, Arc::clone(&cache) as Arc<dyn PoolSampler>],
            thresholds(Duration::ZERO),
        );

        assert!(monitor.backpressure_active());

        cache.set_in_use(1);
        assert!(!monitor.backpressure_active());
    }

    #[test]
    fn cooldown_caches_decision() {
        let sampler = StubSampler::new("database", 9, 10);
        let monitor = PoolMonitor::new(
            vec![Arc::clone(&sampler) as Arc<dyn PoolSampler>],
            thresholds(Duration::from_secs(60)),
        );

        assert!(monitor.backpressure_active());

        // Pool drained, but the cooldown keeps the cached decision.
        sampler.set_in_use(0);
        assert!(monitor.backpressure_active());

        // An explicit sample refreshes immediately.
        monitor.sample_all();
        assert!(!monitor.backpressure_active());
    }

    #[test]
    fn admission_gate_sheds_writes() {
        let sampler = StubSampler::new("database", 9, 10);
        let monitor = PoolMonitor::new(
            vec![Arc::clone(&sampler) as Arc<dyn PoolSampler>],
            thresholds(Duration::ZERO),
        );
        let gate = AdmissionGate::new(Arc::clone(&monitor));

        let err = gate.check_write().unwrap_err();
        assert!(matches!(err, KernelError::Backpressure { .. }));
        assert!(err.is_retryable());
        assert!(gate.read_pressure());

        sampler.set_in_use(2);
        assert!(gate.check_write().is_ok());
    }

    #[test]
    fn history_is_bounded() {
        let sampler = StubSampler::new("database", 1, 10);
        let monitor = PoolMonitor::new(vec![sampler], thresholds(Duration::ZERO));

        for _ in 0..150 {
            monitor.sample_all();
        }
        let history = monitor.history("database", 500);
        assert_eq!(history.len(), HISTORY_MAX);

        let recent = monitor.history("database", 5);
        assert_eq!(recent.len(), 5);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let sampler = StubSampler::new("database", 1, 10);
        let monitor = PoolMonitor::new(vec![sampler], thresholds(Duration::ZERO));

        let handle = monitor.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop();
        handle.await.unwrap();

        assert!(!monitor.history("database", 10).is_empty());
    }
}
