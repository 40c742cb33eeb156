//! Metrics collection for NodeMesh
//!
//! This module provides Prometheus metrics for observability.
//! Counter updates are plain atomics and never take a lock.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for NodeMesh
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub coordinator: CoordinatorMetrics,
}

/// Coordinator-specific metrics
#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    /// Tasks handed to an executor
    pub tasks_dispatched: IntCounter,

    /// Tasks that finished successfully
    pub tasks_completed: IntCounter,

    /// Tasks that finished with an error
    pub tasks_failed: IntCounter,

    /// Tasks cancelled before finishing
    pub tasks_cancelled: IntCounter,

    /// Tasks currently in flight
    pub active_tasks: IntGauge,

    /// Task execution duration
    pub task_duration: Histogram,

    /// Placement decisions made
    pub placement_decisions: IntCounter,

    /// Requests rejected because no node was available
    pub no_nodes_available: IntCounter,

    /// Nodes currently online
    pub online_nodes: IntGauge,

    /// Nodes currently offline
    pub offline_nodes: IntGauge,

    /// Nodes expired by the liveness sweep
    pub nodes_expired: IntCounter,

    /// Fan-out calls whose aggregation failed
    pub aggregation_failures: IntCounter,

    /// Pipeline waves dispatched
    pub pipeline_waves: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let tasks_dispatched = IntCounter::new(
            "coordinator_tasks_dispatched_total",
            "Total number of tasks dispatched to a node",
        )
        .unwrap();

        let tasks_completed = IntCounter::new(
            "coordinator_tasks_completed_total",
            "Total number of tasks completed successfully",
        )
        .unwrap();

        let tasks_failed = IntCounter::new(
            "coordinator_tasks_failed_total",
            "Total number of tasks that finished with an error",
        )
        .unwrap();

        let tasks_cancelled = IntCounter::new(
            "coordinator_tasks_cancelled_total",
            "Total number of tasks cancelled before finishing",
        )
        .unwrap();

        let active_tasks = IntGauge::new(
            "coordinator_active_tasks",
            "Current number of in-flight tasks",
        )
        .unwrap();

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "coordinator_task_duration_seconds",
                "Task execution duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .unwrap();

        let placement_decisions = IntCounter::new(
            "coordinator_placement_decisions_total",
            "Total number of placement decisions",
        )
        .unwrap();

        let no_nodes_available = IntCounter::new(
            "coordinator_no_nodes_available_total",
            "Total requests rejected because no node was available",
        )
        .unwrap();

        let online_nodes = IntGauge::new(
            "coordinator_online_nodes",
            "Current number of online nodes",
        )
        .unwrap();

        let offline_nodes = IntGauge::new(
            "coordinator_offline_nodes",
            "Current number of offline nodes",
        )
        .unwrap();

        let nodes_expired = IntCounter::new(
            "coordinator_nodes_expired_total",
            "Total number of nodes marked offline after missing heartbeats",
        )
        .unwrap();

        let aggregation_failures = IntCounter::new(
            "coordinator_aggregation_failures_total",
            "Total number of fan-out calls whose aggregation failed",
        )
        .unwrap();

        let pipeline_waves = IntCounter::new(
            "coordinator_pipeline_waves_total",
            "Total number of pipeline waves dispatched",
        )
        .unwrap();

        registry.register(Box::new(tasks_dispatched.clone())).unwrap();
        registry.register(Box::new(tasks_completed.clone())).unwrap();
        registry.register(Box::new(tasks_failed.clone())).unwrap();
        registry.register(Box::new(tasks_cancelled.clone())).unwrap();
        registry.register(Box::new(active_tasks.clone())).unwrap();
        registry.register(Box::new(task_duration.clone())).unwrap();
        registry.register(Box::new(placement_decisions.clone())).unwrap();
        registry.register(Box::new(no_nodes_available.clone())).unwrap();
        registry.register(Box::new(online_nodes.clone())).unwrap();
        registry.register(Box::new(offline_nodes.clone())).unwrap();
        registry.register(Box::new(nodes_expired.clone())).unwrap();
        registry.register(Box::new(aggregation_failures.clone())).unwrap();
        registry.register(Box::new(pipeline_waves.clone())).unwrap();

        let coordinator = CoordinatorMetrics {
            tasks_dispatched,
            tasks_completed,
            tasks_failed,
            tasks_cancelled,
            active_tasks,
            task_duration,
            placement_decisions,
            no_nodes_available,
            online_nodes,
            offline_nodes,
            nodes_expired,
            aggregation_failures,
            pipeline_waves,
        };

        MetricsRegistry {
            registry,
            coordinator,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.coordinator.tasks_dispatched.inc();
        metrics.coordinator.active_tasks.inc();
        metrics.coordinator.online_nodes.set(3);

        let output = metrics.gather();
        assert!(output.contains("coordinator_tasks_dispatched_total"));
        assert!(output.contains("coordinator_online_nodes 3"));
    }
}
