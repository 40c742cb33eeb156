//! Capabilities the coordinator consumes but does not implement
//!
//! Execution backends, peer discovery, host telemetry and model metadata
//! live elsewhere; the coordinator only depends on these traits.

use crate::node::{NodeCapabilities, NodeDescriptor, NodeResources};
use crate::request::InferenceRequest;
use async_trait::async_trait;
use nodemesh_common::Result;
use serde_json::Value;

/// What an execution backend returns for one request
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub output: Value,
    pub latency_ms: f64,
    pub confidence: Option<f64>,
}

/// Runs requests against the model-serving backend on this host
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(&self, request: &InferenceRequest) -> Result<ExecutionOutput>;
}

/// Delivers requests to peer nodes
///
/// Network failures must come back as transport errors
/// (`MeshError::is_transport`), model failures as model errors.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, address: &str, request: &InferenceRequest) -> Result<ExecutionOutput>;

    /// Whether the peer at `address` is serving
    async fn health_check(&self, address: &str) -> Result<bool>;
}

/// Source of peer nodes
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<NodeDescriptor>>;
}

/// Resource snapshot of the host this process runs on
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn snapshot(&self) -> Result<NodeResources>;

    fn capabilities(&self) -> NodeCapabilities;
}

/// Model metadata used by capability-based placement
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn supports_gpu(&self, model_id: &str) -> bool;
}
