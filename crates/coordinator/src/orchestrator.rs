//! Distributed orchestrator
//!
//! Single entry point for the service layer. Owns the registry, task store
//! and health monitor, and wires the dispatch components together.

use crate::dispatcher::Dispatcher;
use crate::executor::{LocalExecutor, ModelCatalog, PeerDiscovery, RemoteExecutor, TelemetrySource};
use crate::fanout::{AggregatedResponse, FanOutCoordinator};
use crate::health::{HealthMonitor, MonitorHandles, MonitorSettings};
use crate::node::{Node, NodeDescriptor, NodeResources, NodeStatus};
use crate::pipeline::PipelineScheduler;
use crate::placement::PlacementEngine;
use crate::registry::NodeRegistry;
use crate::request::{InferenceRequest, InferenceResponse};
use crate::task::{DistributedTask, TaskStatus, TaskStore};
use nodemesh_common::error::Result;
use nodemesh_common::{AggregationStrategy, DistributionStrategy, MeshConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Capabilities the orchestrator is built from
pub struct Collaborators {
    pub local: Arc<dyn LocalExecutor>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub discovery: Arc<dyn PeerDiscovery>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub catalog: Arc<dyn ModelCatalog>,
}

pub struct DistributedOrchestrator {
    registry: Arc<NodeRegistry>,
    tasks: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
    fanout: FanOutCoordinator,
    pipeline: PipelineScheduler,
    monitor: Arc<HealthMonitor>,
    handles: Mutex<Option<MonitorHandles>>,
    default_strategy: DistributionStrategy,
    default_aggregation: AggregationStrategy,
}

impl DistributedOrchestrator {
    /// Build the orchestrator and register the local node
    pub fn new(config: &MeshConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let local = local_descriptor(config, collaborators.telemetry.as_ref());
        let registry = Arc::new(NodeRegistry::new(local));
        let tasks = Arc::new(TaskStore::new());
        let placement = Arc::new(PlacementEngine::new(registry.clone(), collaborators.catalog));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            placement,
            tasks.clone(),
            collaborators.local,
            collaborators.remote.clone(),
            config.request_timeout(),
        ));

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            collaborators.discovery,
            collaborators.telemetry,
            collaborators.remote,
            MonitorSettings::from_config(&config.coordinator),
        ));

        info!(
            node_id = %registry.local_node_id(),
            strategy = ?config.coordinator.default_strategy,
            "Distributed orchestrator initialized"
        );

        Ok(Self {
            registry,
            tasks,
            fanout: FanOutCoordinator::new(dispatcher.clone()),
            pipeline: PipelineScheduler::new(dispatcher.clone()),
            dispatcher,
            monitor,
            handles: Mutex::new(None),
            default_strategy: config.coordinator.default_strategy,
            default_aggregation: config.coordinator.default_aggregation,
        })
    }

    /// Start the background health loops; a second call is a no-op
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if handles.is_none() {
            *handles = Some(self.monitor.clone().start());
        }
    }

    /// Stop the background health loops
    pub async fn shutdown(&self) {
        let handles = self.handles.lock().take();
        if let Some(handles) = handles {
            handles.shutdown().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handles.lock().is_some()
    }

    pub fn local_node_id(&self) -> &str {
        self.registry.local_node_id()
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    // Nodes

    pub fn register_node(&self, descriptor: NodeDescriptor) -> Node {
        self.registry.register(descriptor)
    }

    pub fn unregister_node(&self, node_id: &str) -> Result<()> {
        self.registry.unregister(node_id)
    }

    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        self.registry.update_status(node_id, status)
    }

    pub fn update_node_resources(&self, node_id: &str, resources: &NodeResources) -> Result<()> {
        self.registry.update_resources(node_id, resources)
    }

    pub fn update_node_models(&self, node_id: &str, model_ids: Vec<String>) -> Result<()> {
        self.registry.update_available_models(node_id, model_ids)
    }

    /// Nodes ordered by id; offline ones only when asked for
    pub fn list_nodes(&self, include_offline: bool) -> Vec<Node> {
        self.registry.list(include_offline)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.registry.get(node_id)
    }

    // Inference

    /// Run one request; `None` uses the configured strategy
    pub async fn run_distributed_inference(
        &self,
        request: InferenceRequest,
        strategy: Option<DistributionStrategy>,
    ) -> Result<InferenceResponse> {
        self.dispatcher
            .run_one(request, strategy.unwrap_or(self.default_strategy))
            .await
    }

    /// Run `request` against several models and combine the answers
    pub async fn run_parallel_inference(
        &self,
        request: &InferenceRequest,
        model_ids: &[String],
        aggregation: Option<AggregationStrategy>,
    ) -> Result<AggregatedResponse> {
        self.fanout
            .run_parallel_aggregated(
                request,
                model_ids,
                self.default_strategy,
                aggregation.unwrap_or(self.default_aggregation),
            )
            .await
    }

    pub async fn run_batch_inference(
        &self,
        requests: Vec<InferenceRequest>,
        strategy: Option<DistributionStrategy>,
    ) -> Result<Vec<InferenceResponse>> {
        self.fanout
            .run_batch(requests, strategy.unwrap_or(self.default_strategy))
            .await
    }

    pub async fn run_pipeline_inference(
        &self,
        requests: Vec<InferenceRequest>,
        dependencies: Vec<Vec<usize>>,
        strategy: Option<DistributionStrategy>,
    ) -> Result<Vec<InferenceResponse>> {
        self.pipeline
            .run_pipeline(requests, dependencies, strategy.unwrap_or(self.default_strategy))
            .await
    }

    // Tasks

    pub fn get_task(&self, task_id: &str) -> Option<DistributedTask> {
        self.tasks.get(task_id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, node_id: Option<&str>) -> Vec<DistributedTask> {
        self.tasks.list(status, node_id)
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.tasks.cancel(task_id)
    }
}

/// Identity of this process as a node
fn local_descriptor(config: &MeshConfig, telemetry: &dyn TelemetrySource) -> NodeDescriptor {
    let id = config
        .node
        .node_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let hostname = config
        .node
        .hostname
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    let address = if config.node.address.is_empty() {
        format!("http://{}:{}", config.bind_address, config.port)
    } else {
        config.node.address.clone()
    };

    let mut capabilities = telemetry.capabilities();
    if config.node.gpu_count > 0 {
        capabilities.gpu_available = true;
        capabilities.gpu_count = config.node.gpu_count;
    }

    NodeDescriptor {
        id,
        hostname,
        address,
        available_models: config.node.available_models.iter().cloned().collect(),
        capabilities,
    }
}
