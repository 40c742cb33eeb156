//! Node placement
//!
//! Picks the node(s) that should serve a model. Decisions are made on
//! lock-free snapshots of the registry, so concurrent placements may see
//! slightly stale load figures; that only affects placement quality.

use crate::executor::ModelCatalog;
use crate::node::Node;
use crate::registry::NodeRegistry;
use nodemesh_common::{DistributionStrategy, METRICS};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Missing telemetry ranks as fully loaded
const UNKNOWN_USAGE_PERCENT: f64 = 100.0;

/// Chooses nodes for requests
pub struct PlacementEngine {
    registry: Arc<NodeRegistry>,
    catalog: Arc<dyn ModelCatalog>,

    /// Round-robin position per model id
    cursors: Mutex<HashMap<String, usize>>,
}

impl PlacementEngine {
    pub fn new(registry: Arc<NodeRegistry>, catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            registry,
            catalog,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Select one node for `model_id`, or `None` when no node is online
    pub async fn select_node(&self, model_id: &str, strategy: DistributionStrategy) -> Option<String> {
        let candidates = self.candidates(model_id);
        if candidates.is_empty() {
            warn!(model_id = %model_id, "No online nodes available");
            METRICS.coordinator.no_nodes_available.inc();
            return None;
        }

        let selected = match strategy {
            DistributionStrategy::RoundRobin => {
                let start = self.advance_cursor(model_id, 1, candidates.len());
                candidates[start].id.clone()
            }
            _ => self.rank(model_id, candidates, strategy).await.into_iter().next()?.id,
        };

        METRICS.coordinator.placement_decisions.inc();
        debug!(model_id = %model_id, node_id = %selected, ?strategy, "Selected node");
        Some(selected)
    }

    /// Ordered node list to spread `count` requests over
    ///
    /// Preferred nodes come first; the remaining candidates are appended so
    /// every request still gets an assignment when the preferred pool is
    /// smaller than `count`. The list never exceeds `count` entries.
    pub async fn select_nodes_for_batch(
        &self,
        model_id: &str,
        count: usize,
        strategy: DistributionStrategy,
    ) -> Vec<String> {
        let candidates = self.candidates(model_id);
        if candidates.is_empty() || count == 0 {
            if count > 0 {
                METRICS.coordinator.no_nodes_available.inc();
            }
            return Vec::new();
        }

        let ordered = match strategy {
            DistributionStrategy::RoundRobin => {
                let start = self.advance_cursor(model_id, count, candidates.len());
                let mut rotated = candidates;
                rotated.rotate_left(start);
                rotated
            }
            _ => self.rank(model_id, candidates, strategy).await,
        };

        METRICS.coordinator.placement_decisions.inc();
        ordered.into_iter().take(count).map(|node| node.id).collect()
    }

    /// Online nodes advertising the model, or every online node if none does
    fn candidates(&self, model_id: &str) -> Vec<Node> {
        let online = self.registry.list_online();
        let with_model: Vec<Node> = online.iter().filter(|n| n.has_model(model_id)).cloned().collect();

        if with_model.is_empty() {
            online
        } else {
            with_model
        }
    }

    /// Order candidates best-first for a non-rotating strategy
    async fn rank(&self, model_id: &str, candidates: Vec<Node>, strategy: DistributionStrategy) -> Vec<Node> {
        match strategy {
            DistributionStrategy::RoundRobin | DistributionStrategy::LeastLoaded => {
                by_least_loaded(candidates)
            }
            DistributionStrategy::CapabilityBased => {
                let wants_gpu = self.catalog.supports_gpu(model_id).await;
                let (gpu, other): (Vec<Node>, Vec<Node>) =
                    candidates.into_iter().partition(|n| n.capabilities.gpu_available);

                if wants_gpu && !gpu.is_empty() {
                    let mut ordered = by_usage(gpu, |n| n.resources.gpu_percent);
                    ordered.extend(by_usage(other, |n| n.resources.cpu_percent));
                    ordered
                } else {
                    let all = gpu.into_iter().chain(other).collect();
                    by_usage(all, |n| n.resources.cpu_percent)
                }
            }
            DistributionStrategy::LatencyOptimized => {
                let (mut timed, untimed): (Vec<Node>, Vec<Node>) = candidates
                    .into_iter()
                    .partition(|n| n.average_response_time_ms.is_some());

                timed.sort_by(|a, b| {
                    let a_ms = a.average_response_time_ms.unwrap_or(f64::INFINITY);
                    let b_ms = b.average_response_time_ms.unwrap_or(f64::INFINITY);
                    a_ms.total_cmp(&b_ms).then_with(|| a.id.cmp(&b.id))
                });
                timed.extend(by_least_loaded(untimed));
                timed
            }
        }
    }

    /// Return the current cursor for `model_id` and move it `step` forward
    fn advance_cursor(&self, model_id: &str, step: usize, len: usize) -> usize {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(model_id.to_string()).or_insert(0);
        let start = *cursor % len;
        *cursor = cursor.wrapping_add(step);
        start
    }
}

fn by_least_loaded(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by(|a, b| a.current_tasks.cmp(&b.current_tasks).then_with(|| a.id.cmp(&b.id)));
    nodes
}

fn by_usage<F>(mut nodes: Vec<Node>, usage: F) -> Vec<Node>
where
    F: Fn(&Node) -> Option<f64>,
{
    nodes.sort_by(|a, b| {
        let a_usage = usage(a).unwrap_or(UNKNOWN_USAGE_PERCENT);
        let b_usage = usage(b).unwrap_or(UNKNOWN_USAGE_PERCENT);
        match a_usage.total_cmp(&b_usage) {
            Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        }
    });
    nodes
}
