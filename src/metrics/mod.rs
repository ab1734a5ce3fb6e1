//! Prometheus metrics for the cluster core
//!
//! This module provides metrics tracking for:
//! - Queue: depth per tier, enqueue/process counts, retries, dead letters, shedding
//! - Scheduler: assignment latency
//! - Cluster: leader changes, registered nodes, node membership events
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! Until that succeeds every recorder is a no-op, so library code can record
//! unconditionally.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for queue metrics
struct QueueMetrics {
    depth: GaugeVec,
    enqueued: CounterVec,
    processed: CounterVec,
    retries: Counter,
    dead_letters: CounterVec,
    shed: Counter,
}

/// Container for scheduler and membership metrics
struct ClusterMetrics {
    assignment_latency: Histogram,
    leader_changes: Counter,
    registered_nodes: Gauge,
    node_events: CounterVec,
}

static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

static CLUSTER_METRICS: OnceLock<ClusterMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Registers into the default registry. A failed registration leaves every
/// recorder as a no-op; the process keeps running without metrics.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = crawlmesh::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let queue = QueueMetrics {
        depth: register_gauge_vec!(
            "crawlmesh_queue_depth",
            "Unacknowledged jobs per priority tier",
            &["tier"]
        )?,
        enqueued: register_counter_vec!(
            "crawlmesh_jobs_enqueued_total",
            "Jobs published per priority tier",
            &["tier"]
        )?,
        processed: register_counter_vec!(
            "crawlmesh_jobs_processed_total",
            "Jobs handled successfully per priority tier",
            &["tier"]
        )?,
        retries: register_counter!(
            "crawlmesh_job_retries_total",
            "Jobs republished after a handler failure"
        )?,
        dead_letters: register_counter_vec!(
            "crawlmesh_dead_letters_total",
            "Jobs routed to the dead-letter topic",
            &["reason"]
        )?,
        shed: register_counter!(
            "crawlmesh_jobs_shed_total",
            "Lower-priority jobs shed under backpressure"
        )?,
    };

    let cluster = ClusterMetrics {
        assignment_latency: register_histogram!(
            "crawlmesh_assignment_latency_seconds",
            "Duration of one assignment decision",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
        )?,
        leader_changes: register_counter!(
            "crawlmesh_leader_changes_total",
            "Leadership acquisitions and losses observed by this process"
        )?,
        registered_nodes: register_gauge!(
            "crawlmesh_registered_nodes",
            "Nodes present in the registry at the last observation"
        )?,
        node_events: register_counter_vec!(
            "crawlmesh_node_events_total",
            "Node membership events by kind",
            &["kind"]
        )?,
    };

    QUEUE_METRICS
        .set(queue)
        .map_err(|_| "Queue metrics already initialized")?;
    CLUSTER_METRICS
        .set(cluster)
        .map_err(|_| "Cluster metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    QUEUE_METRICS.get().is_some() && CLUSTER_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Queue Recorders
// ============================================================================

pub fn set_queue_depth(tier: u8, depth: usize) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.depth
            .with_label_values(&[&tier.to_string()])
            .set(depth as f64);
    }
}

pub fn record_enqueued(tier: u8) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.enqueued.with_label_values(&[&tier.to_string()]).inc();
    }
}

pub fn record_processed(tier: u8) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.processed.with_label_values(&[&tier.to_string()]).inc();
    }
}

pub fn record_retry() {
    if let Some(m) = QUEUE_METRICS.get() {
        m.retries.inc();
    }
}

/// Record a dead-lettered job (`reason` is e.g. `retries_exhausted`, `shed`)
pub fn record_dead_letter(reason: &str) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    m.dead_letters.with_label_values(&[reason]).inc();
    if reason == "shed" {
        m.shed.inc();
    }
}

// ============================================================================
// Cluster Recorders
// ============================================================================

pub fn record_leader_change() {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.leader_changes.inc();
    }
}

pub fn set_registered_nodes(count: usize) {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.registered_nodes.set(count as f64);
    }
}

pub fn record_node_event(kind: &str) {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.node_events.with_label_values(&[kind]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }

    /// Drop the measurement instead of recording it
    pub fn discard(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_discard();
        }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start an assignment timer; the decision latency is recorded on drop
pub fn start_assignment_timer() -> MetricsTimer {
    match CLUSTER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.assignment_latency.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    #[serial]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    #[serial]
    fn test_encode_metrics_contains_queue_metrics() {
        ensure_metrics_initialized();
        record_enqueued(9);
        set_queue_depth(9, 3);

        let text = encode_metrics().unwrap();
        assert!(text.contains("crawlmesh_jobs_enqueued_total"));
        assert!(text.contains("crawlmesh_queue_depth"));
    }

    #[test]
    #[serial]
    fn test_dead_letter_shed_counts_both() {
        ensure_metrics_initialized();
        record_dead_letter("shed");
        record_dead_letter("retries_exhausted");

        let text = encode_metrics().unwrap();
        assert!(text.contains("crawlmesh_jobs_shed_total"));
        assert!(text.contains("reason=\"retries_exhausted\""));
    }

    #[test]
    #[serial]
    fn test_cluster_recorders() {
        ensure_metrics_initialized();
        record_leader_change();
        set_registered_nodes(2);
        record_node_event("failed");
        drop(start_assignment_timer());

        let text = encode_metrics().unwrap();
        assert!(text.contains("crawlmesh_assignment_latency_seconds_count"));
        assert!(text.contains("kind=\"failed\""));
    }

    #[test]
    fn test_noop_timer_discard() {
        MetricsTimer::noop().discard();
    }
}
