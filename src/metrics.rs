//! Process-local pipeline counters with Prometheus text exposition.
//!
//! Counters are advisory (reset on restart) and never load-bearing; durable
//! truth lives in the database. Shared by handle via `Arc`, injected into the
//! server state and the worker rather than held as a module global.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub http_requests_total: AtomicU64,
    pub http_rejected_total: AtomicU64,
    pub events_received_total: AtomicU64,
    pub events_inserted_total: AtomicU64,
    pub events_duplicate_total: AtomicU64,
    pub events_dead_lettered_total: AtomicU64,
    pub worker_processed_total: AtomicU64,
    pub worker_failed_total: AtomicU64,
    pub worker_cycles_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        let mut gauge = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        gauge(
            "evalflow_http_requests_total",
            "HTTP requests handled",
            self.http_requests_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_http_rejected_total",
            "HTTP requests rejected (4xx)",
            self.http_rejected_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_events_received_total",
            "Events received in ingest batches",
            self.events_received_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_events_inserted_total",
            "Raw events newly inserted",
            self.events_inserted_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_events_duplicate_total",
            "Events skipped as duplicates",
            self.events_duplicate_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_events_dead_lettered_total",
            "Batches or events sent to the dead-letter sink",
            self.events_dead_lettered_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_worker_processed_total",
            "Raw events materialized successfully",
            self.worker_processed_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_worker_failed_total",
            "Raw event processing failures (per attempt)",
            self.worker_failed_total.load(Ordering::Relaxed),
        );
        gauge(
            "evalflow_worker_cycles_total",
            "Worker poll cycles",
            self.worker_cycles_total.load(Ordering::Relaxed),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counts() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::add(&metrics.events_received_total, 7);
        PipelineMetrics::incr(&metrics.worker_cycles_total);
        let text = metrics.render();
        assert!(text.contains("evalflow_events_received_total 7"));
        assert!(text.contains("evalflow_worker_cycles_total 1"));
        assert!(text.contains("# TYPE evalflow_http_requests_total counter"));
    }
}
