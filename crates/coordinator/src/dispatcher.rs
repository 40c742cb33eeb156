//! Single-task dispatch
//!
//! Places a request, records it in the task store and runs it on the local
//! backend or a peer. Node counters are settled by [`InFlight`] when it is
//! dropped, so they are released on success, failure, timeout, explicit
//! cancellation, and when the dispatching future itself is dropped.

use crate::executor::{ExecutionOutput, LocalExecutor, RemoteExecutor};
use crate::placement::PlacementEngine;
use crate::registry::{NodeHandle, NodeRegistry};
use crate::request::{InferenceRequest, InferenceResponse};
use crate::task::{TaskStatus, TaskStore};
use nodemesh_common::error::{MeshError, Result};
use nodemesh_common::{DistributionStrategy, METRICS};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Executes one request on one node
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    placement: Arc<PlacementEngine>,
    tasks: Arc<TaskStore>,
    local: Arc<dyn LocalExecutor>,
    remote: Arc<dyn RemoteExecutor>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        placement: Arc<PlacementEngine>,
        tasks: Arc<TaskStore>,
        local: Arc<dyn LocalExecutor>,
        remote: Arc<dyn RemoteExecutor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            placement,
            tasks,
            local,
            remote,
            request_timeout,
        }
    }

    pub fn placement(&self) -> &Arc<PlacementEngine> {
        &self.placement
    }

    /// Place `request` with `strategy` and run it
    pub async fn run_one(
        &self,
        request: InferenceRequest,
        strategy: DistributionStrategy,
    ) -> Result<InferenceResponse> {
        let node_id = self
            .placement
            .select_node(&request.model_id, strategy)
            .await
            .ok_or_else(|| {
                MeshError::no_suitable_node(format!(
                    "No suitable node found for model {}",
                    request.model_id
                ))
            })?;

        self.run_on_node(request, &node_id).await
    }

    /// Run `request` on an already chosen node
    pub async fn run_on_node(&self, request: InferenceRequest, node_id: &str) -> Result<InferenceResponse> {
        let node = self.registry.handle(node_id).ok_or_else(|| {
            MeshError::no_suitable_node(format!("Node {} is no longer registered", node_id))
        })?;
        let address = node.lock().address.clone();
        let is_local = self.registry.is_local(node_id);

        let (task_id, cancelled) = self.tasks.create(request.clone(), node_id);
        let mut in_flight = InFlight::begin(node, &self.tasks, task_id.clone());

        if self.tasks.mark_running(&task_id).is_err() {
            in_flight.settled = true;
            METRICS.coordinator.tasks_cancelled.inc();
            return Err(MeshError::Cancelled(task_id));
        }

        info!(
            task_id = %task_id,
            node_id = %node_id,
            model_id = %request.model_id,
            local = is_local,
            "Running task"
        );

        let started = Instant::now();
        let execution = async {
            if is_local {
                self.local.execute(&request).await
            } else {
                self.remote
                    .execute(&address, &request)
                    .await
                    .map_err(|e| MeshError::remote_execution(node_id, e))
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.request_timeout, execution) => match result {
                Ok(result) => result,
                Err(_) => Err(MeshError::timeout(format!(
                    "task {} exceeded {:?} on node {}",
                    task_id, self.request_timeout, node_id
                ))),
            },
            _ = cancelled.notified() => {
                in_flight.settled = true;
                METRICS.coordinator.tasks_cancelled.inc();
                debug!(task_id = %task_id, "Stopped waiting on cancelled task");
                return Err(MeshError::Cancelled(task_id));
            }
        };

        let elapsed = started.elapsed();
        METRICS.coordinator.task_duration.observe(elapsed.as_secs_f64());

        match outcome {
            Ok(output) => {
                let response = build_response(&request, output, node_id, &task_id, is_local);
                in_flight.settled = true;
                in_flight.latency_ms = Some(elapsed.as_secs_f64() * 1000.0);

                if self.tasks.complete(&task_id, response.clone()).is_err()
                    && self.tasks.status(&task_id) == Some(TaskStatus::Cancelled)
                {
                    METRICS.coordinator.tasks_cancelled.inc();
                    return Err(MeshError::Cancelled(task_id));
                }

                METRICS.coordinator.tasks_completed.inc();
                Ok(response)
            }
            Err(e) => {
                warn!(task_id = %task_id, node_id = %node_id, error = %e, "Task failed");
                in_flight.settled = true;
                if let Err(store_err) = self.tasks.fail(&task_id, &e) {
                    debug!(task_id = %task_id, error = %store_err, "Task already settled");
                }
                METRICS.coordinator.tasks_failed.inc();
                Err(e)
            }
        }
    }
}

fn build_response(
    request: &InferenceRequest,
    output: ExecutionOutput,
    node_id: &str,
    task_id: &str,
    is_local: bool,
) -> InferenceResponse {
    let mut metadata = Map::new();
    metadata.insert("node_id".to_string(), json!(node_id));
    metadata.insert("local".to_string(), json!(is_local));

    InferenceResponse {
        model_id: request.model_id.clone(),
        output: output.output,
        node_id: Some(node_id.to_string()),
        task_id: Some(task_id.to_string()),
        latency_ms: Some(output.latency_ms),
        confidence: output.confidence,
        error: None,
        metadata,
    }
}

/// Holds one unit of a node's `current_tasks` for the life of a dispatch
struct InFlight<'a> {
    node: NodeHandle,
    tasks: &'a TaskStore,
    task_id: String,

    /// Set once the dispatcher has recorded a terminal state
    settled: bool,

    /// Latency folded into the node's average, successful tasks only
    latency_ms: Option<f64>,
}

impl<'a> InFlight<'a> {
    fn begin(node: NodeHandle, tasks: &'a TaskStore, task_id: String) -> Self {
        node.lock().current_tasks += 1;
        METRICS.coordinator.tasks_dispatched.inc();
        METRICS.coordinator.active_tasks.inc();

        Self {
            node,
            tasks,
            task_id,
            settled: false,
            latency_ms: None,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // The dispatching future was dropped, e.g. a losing race branch.
            if self.tasks.cancel(&self.task_id).is_ok() {
                METRICS.coordinator.tasks_cancelled.inc();
                debug!(task_id = %self.task_id, "Task abandoned by caller");
            }
        }

        let mut node = self.node.lock();
        node.current_tasks = node.current_tasks.saturating_sub(1);
        node.total_tasks_processed += 1;
        if let Some(latency_ms) = self.latency_ms {
            node.record_latency(latency_ms);
        }
        METRICS.coordinator.active_tasks.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticModelCatalog;
    use crate::test_support::{descriptor, descriptor_with_models, MockExecutor, Reply};
    use futures::future::join_all;
    use serde_json::json;

    struct Fixture {
        registry: Arc<NodeRegistry>,
        tasks: Arc<TaskStore>,
        local: Arc<MockExecutor>,
        remote: Arc<MockExecutor>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let registry = Arc::new(NodeRegistry::new(descriptor("local")));
        let placement = Arc::new(PlacementEngine::new(
            registry.clone(),
            Arc::new(StaticModelCatalog::default()),
        ));
        let tasks = Arc::new(TaskStore::new());
        let local = Arc::new(MockExecutor::new());
        let remote = Arc::new(MockExecutor::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            placement,
            tasks.clone(),
            local.clone(),
            remote.clone(),
            timeout,
        ));

        Fixture {
            registry,
            tasks,
            local,
            remote,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_runs_locally_and_updates_counters() {
        let f = fixture(Duration::from_secs(5));
        f.local.reply("test-model", Reply::Output(json!("Test output")));

        let response = f
            .dispatcher
            .run_one(InferenceRequest::new("test-model", json!("Test input")), DistributionStrategy::LeastLoaded)
            .await
            .unwrap();

        assert_eq!(response.output, json!("Test output"));
        assert_eq!(response.node_id.as_deref(), Some("local"));
        assert_eq!(response.metadata.get("local"), Some(&json!(true)));

        let node = f.registry.get("local").unwrap();
        assert_eq!(node.current_tasks, 0);
        assert_eq!(node.total_tasks_processed, 1);
        assert!(node.average_response_time_ms.is_some());

        let task = f.tasks.get(response.task_id.as_deref().unwrap()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_node, "local");
        assert_eq!(f.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_runs_remotely_on_peer_with_model() {
        let f = fixture(Duration::from_secs(5));
        f.registry.register(descriptor_with_models("remote-node", &["test-model"]));
        f.remote.reply("test-model", Reply::Confident(json!("Remote output"), 0.9));

        let response = f
            .dispatcher
            .run_one(InferenceRequest::new("test-model", json!("x")), DistributionStrategy::LeastLoaded)
            .await
            .unwrap();

        assert_eq!(response.output, json!("Remote output"));
        assert_eq!(response.node_id.as_deref(), Some("remote-node"));
        assert_eq!(response.confidence, Some(0.9));
        assert_eq!(f.remote.addresses(), vec!["http://remote-node:50051".to_string()]);
        assert_eq!(f.local.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_tasks_settle_counters() {
        let f = fixture(Duration::from_secs(5));
        f.local.set_delay(Duration::from_millis(20));

        let runs = (0..10).map(|i| {
            let dispatcher = f.dispatcher.clone();
            async move {
                dispatcher
                    .run_one(
                        InferenceRequest::new("m", json!(i)),
                        DistributionStrategy::LeastLoaded,
                    )
                    .await
            }
        });
        let results = join_all(runs).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let node = f.registry.get("local").unwrap();
        assert_eq!(node.current_tasks, 0);
        assert_eq!(node.total_tasks_processed, 10);
        assert_eq!(f.tasks.list(Some(TaskStatus::Completed), None).len(), 10);
    }

    #[tokio::test]
    async fn test_failure_still_counts_as_processed() {
        let f = fixture(Duration::from_secs(5));
        f.registry.register(descriptor_with_models("remote-node", &["m"]));
        f.remote.reply("m", Reply::Transport("connection reset".to_string()));

        let err = f
            .dispatcher
            .run_one(InferenceRequest::new("m", json!("x")), DistributionStrategy::LeastLoaded)
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::RemoteExecution { .. }));
        assert!(err.is_transport());

        let node = f.registry.get("remote-node").unwrap();
        assert_eq!(node.current_tasks, 0);
        assert_eq!(node.total_tasks_processed, 1);
        assert_eq!(node.average_response_time_ms, None);

        let failed = f.tasks.list(Some(TaskStatus::Error), None);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("connection reset"));
        assert!(failed[0].result.is_none());
    }

    #[tokio::test]
    async fn test_no_suitable_node() {
        let f = fixture(Duration::from_secs(5));
        f.registry
            .update_status("local", crate::node::NodeStatus::Offline)
            .unwrap();

        let err = f
            .dispatcher
            .run_one(InferenceRequest::new("m", json!("x")), DistributionStrategy::RoundRobin)
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::NoSuitableNode(_)));
        assert!(f.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_task_error() {
        let f = fixture(Duration::from_millis(50));
        f.local.reply("slow", Reply::Hang);

        let err = f
            .dispatcher
            .run_one(InferenceRequest::new("slow", json!("x")), DistributionStrategy::LeastLoaded)
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::Timeout(_)));
        assert_eq!(f.tasks.list(Some(TaskStatus::Error), None).len(), 1);
        assert_eq!(f.registry.get("local").unwrap().current_tasks, 0);
    }

    #[tokio::test]
    async fn test_explicit_cancel_of_running_task() {
        let f = fixture(Duration::from_secs(5));
        f.local.reply("slow", Reply::Hang);

        let dispatcher = f.dispatcher.clone();
        let run = tokio::spawn(async move {
            dispatcher
                .run_one(InferenceRequest::new("slow", json!("x")), DistributionStrategy::LeastLoaded)
                .await
        });

        // Wait for the task to show up as running.
        let task_id = loop {
            if let Some(task) = f.tasks.list(Some(TaskStatus::Running), None).pop() {
                break task.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        f.tasks.cancel(&task_id).unwrap();
        let err = run.await.unwrap().unwrap_err();

        assert!(matches!(err, MeshError::Cancelled(_)));
        assert_eq!(f.tasks.status(&task_id), Some(TaskStatus::Cancelled));
        let node = f.registry.get("local").unwrap();
        assert_eq!(node.current_tasks, 0);
        assert_eq!(node.total_tasks_processed, 1);
    }

    #[tokio::test]
    async fn test_dropped_dispatch_is_cancelled() {
        let f = fixture(Duration::from_secs(5));
        f.local.reply("slow", Reply::Hang);

        let outcome = tokio::time::timeout(
            Duration::from_millis(30),
            f.dispatcher
                .run_one(InferenceRequest::new("slow", json!("x")), DistributionStrategy::LeastLoaded),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(f.tasks.list(Some(TaskStatus::Cancelled), None).len(), 1);
        assert_eq!(f.registry.get("local").unwrap().current_tasks, 0);
    }
}
