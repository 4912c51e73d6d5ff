//! In-process metrics registry.
//!
//! Counters, gauges, and fixed-bucket histograms keyed by metric family
//! plus a rendered label set. Counters and histograms accumulate at
//! write time with relaxed atomics; gauges are set on demand: the
//! engine refreshes them from batched store aggregates when the metrics
//! endpoint is read, so idle processes pay nothing.
//!
//! Rendering produces the conventional text exposition format. Label
//! values come from closed enums (statuses, tool names, pool names), so
//! cardinality stays bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Default histogram buckets, in seconds.
const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

struct Histogram {
    bucket_counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: (0..BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_bits: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        for (i, bound) in BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        // CAS loop to accumulate an f64 in atomic bits.
        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + value;
            match self.sum_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

type Series<T> = DashMap<String, DashMap<String, T>>;

/// The process-wide metrics registry. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<Series<AtomicU64>>,
    gauges: Arc<Series<AtomicU64>>,
    histograms: Arc<Series<Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn label_key(labels: &[(&str, &str)]) -> String {
        labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Increment a counter series by 1.
    pub fn inc(&self, family: &str, labels: &[(&str, &str)]) {
        self.inc_by(family, labels, 1);
    }

    /// Increment a counter series by `delta`.
    pub fn inc_by(&self, family: &str, labels: &[(&str, &str)], delta: u64) {
        self.counters
            .entry(family.to_string())
            .or_default()
            .entry(Self::label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a counter series (mostly for tests and stats endpoints).
    pub fn counter_value(&self, family: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(family)
            .and_then(|series| {
                series
                    .get(&Self::label_key(labels))
                    .map(|v| v.load(Ordering::Relaxed))
            })
            .unwrap_or(0)
    }

    /// Set a gauge series to an absolute value.
    pub fn set_gauge(&self, family: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .entry(family.to_string())
            .or_default()
            .entry(Self::label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    /// Read a gauge series.
    pub fn gauge_value(&self, family: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .get(family)
            .and_then(|series| {
                series
                    .get(&Self::label_key(labels))
                    .map(|v| f64::from_bits(v.load(Ordering::Relaxed)))
            })
            .unwrap_or(0.0)
    }

    /// Record a duration-style observation, in seconds.
    pub fn observe(&self, family: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .entry(family.to_string())
            .or_default()
            .entry(Self::label_key(labels))
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    /// Render the whole registry in text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counter_families: Vec<String> =
            self.counters.iter().map(|e| e.key().clone()).collect();
        counter_families.sort();
        for family in counter_families {
            out.push_str(&format!("# TYPE {family} counter\n"));
            if let Some(series) = self.counters.get(&family) {
                let mut rows: Vec<(String, u64)> = series
                    .iter()
                    .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                    .collect();
                rows.sort();
                for (labels, value) in rows {
                    if labels.is_empty() {
                        out.push_str(&format!("{family} {value}\n"));
                    } else {
                        out.push_str(&format!("{family}{{{labels}}} {value}\n"));
                    }
                }
            }
        }

        let mut gauge_families: Vec<String> =
            self.gauges.iter().map(|e| e.key().clone()).collect();
        gauge_families.sort();
        for family in gauge_families {
            out.push_str(&format!("# TYPE {family} gauge\n"));
            if let Some(series) = self.gauges.get(&family) {
                let mut rows: Vec<(String, f64)> = series
                    .iter()
                    .map(|e| {
                        (
                            e.key().clone(),
                            f64::from_bits(e.value().load(Ordering::Relaxed)),
                        )
                    })
                    .collect();
                rows.sort_by(|a, b| a.0.cmp(&b.0));
                for (labels, value) in rows {
                    if labels.is_empty() {
                        out.push_str(&format!("{family} {value}\n"));
                    } else {
                        out.push_str(&format!("{family}{{{labels}}} {value}\n"));
                    }
                }
            }
        }

        let mut histogram_families: Vec<String> =
            self.histograms.iter().map(|e| e.key().clone()).collect();
        histogram_families.sort();
        for family in histogram_families {
            out.push_str(&format!("# TYPE {family} histogram\n"));
            if let Some(series) = self.histograms.get(&family) {
                let mut keys: Vec<String> = series.iter().map(|e| e.key().clone()).collect();
                keys.sort();
                for labels in keys {
                    if let Some(histogram) = series.get(&labels) {
                        let prefix = if labels.is_empty() {
                            String::new()
                        } else {
                            format!("{labels},")
                        };
                        for (i, bound) in BUCKETS.iter().enumerate() {
                            let count = histogram.bucket_counts[i].load(Ordering::Relaxed);
                            out.push_str(&format!(
                                "{family}_bucket{{{prefix}le=\"{bound}\"}} {count}\n"
                            ));
                        }
                        let total = histogram.count.load(Ordering::Relaxed);
                        out.push_str(&format!(
                            "{family}_bucket{{{prefix}le=\"+Inf\"}} {total}\n"
                        ));
                        out.push_str(&format!("{family}_sum{{{labels}}} {}\n", histogram.sum()));
                        out.push_str(&format!("{family}_count{{{labels}}} {total}\n"));
                    }
                }
            }
        }

        out
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = Metrics::new();
        metrics.inc("taskmesh_subtasks_total", &[("status", "completed")]);
        metrics.inc("taskmesh_subtasks_total", &[("status", "completed")]);
        metrics.inc("taskmesh_subtasks_total", &[("status", "failed")]);

        assert_eq!(
            metrics.counter_value("taskmesh_subtasks_total", &[("status", "completed")]),
            2
        );
        assert_eq!(
            metrics.counter_value("taskmesh_subtasks_total", &[("status", "failed")]),
            1
        );
        assert_eq!(
            metrics.counter_value("taskmesh_subtasks_total", &[("status", "cancelled")]),
            0
        );
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.set_gauge("taskmesh_queue_depth", &[], 5.0);
        metrics.set_gauge("taskmesh_queue_depth", &[], 2.0);
        assert_eq!(metrics.gauge_value("taskmesh_queue_depth", &[]), 2.0);
    }

    #[test]
    fn histogram_buckets_and_sum() {
        let metrics = Metrics::new();
        metrics.observe("taskmesh_allocation_seconds", &[], 0.03);
        metrics.observe("taskmesh_allocation_seconds", &[], 0.2);
        metrics.observe("taskmesh_allocation_seconds", &[], 7.0);

        let rendered = metrics.render();
        assert!(rendered.contains("# TYPE taskmesh_allocation_seconds histogram"));
        assert!(rendered.contains("taskmesh_allocation_seconds_bucket{le=\"0.05\"} 1"));
        assert!(rendered.contains("taskmesh_allocation_seconds_bucket{le=\"0.25\"} 2"));
        assert!(rendered.contains("taskmesh_allocation_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(rendered.contains("taskmesh_allocation_seconds_count{} 3"));
    }

    #[test]
    fn render_includes_labels() {
        let metrics = Metrics::new();
        metrics.inc(
            "taskmesh_http_requests_total",
            &[("method", "POST"), ("path", "/tasks"), ("status", "201")],
        );
        metrics.set_gauge("taskmesh_workers", &[("status", "online")], 3.0);

        let rendered = metrics.render();
        assert!(rendered.contains(
            "taskmesh_http_requests_total{method=\"POST\",path=\"/tasks\",status=\"201\"} 1"
        ));
        assert!(rendered.contains("taskmesh_workers{status=\"online\"} 3"));
        assert!(rendered.contains("# TYPE taskmesh_http_requests_total counter"));
        assert!(rendered.contains("# TYPE taskmesh_workers gauge"));
    }
}
