//! Shared application state for the web edge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use taskmesh_engine::Orchestrator;
use taskmesh_kernel::{PoolSample, PoolSampler};

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The fully wired orchestration engine.
    pub orch: Arc<Orchestrator>,
    /// Live WebSocket connection count, bounded per replica.
    pub ws_connections: Arc<AtomicU64>,
    /// In-flight HTTP request count feeding the pool monitor.
    pub in_flight: Arc<InFlightSampler>,
}

impl AppState {
    pub fn new(orch: Arc<Orchestrator>, in_flight: Arc<InFlightSampler>) -> Self {
        Self {
            orch,
            ws_connections: Arc::new(AtomicU64::new(0)),
            in_flight,
        }
    }
}

/// Treats in-flight HTTP requests as a bounded pool so the admission
/// gate can shed writes when the replica saturates.
pub struct InFlightSampler {
    current: AtomicU64,
    capacity: u64,
}

impl InFlightSampler {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicU64::new(0),
            capacity,
        })
    }

    pub fn enter(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit(&self) {
        let previous = self.current.fetch_sub(1, Ordering::Relaxed);
        if previous == 0 {
            // Unbalanced exit; clamp rather than wrap.
            self.current.store(0, Ordering::Relaxed);
        }
    }
}

impl PoolSampler for InFlightSampler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn sample(&self) -> PoolSample {
        PoolSample {
            in_use: self.current.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
