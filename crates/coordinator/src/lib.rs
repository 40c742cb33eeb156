//! NodeMesh Coordinator
//!
//! Distribution layer for inference across a mesh of nodes: node registry,
//! liveness monitoring, placement, task tracking, fan-out aggregation and
//! dependency-ordered pipelines.

pub mod catalog;
pub mod discovery;
pub mod dispatcher;
pub mod executor;
pub mod fanout;
pub mod health;
pub mod node;
pub mod node_client;
pub mod orchestrator;
pub mod pipeline;
pub mod placement;
pub mod registry;
pub mod request;
pub mod task;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use catalog::StaticModelCatalog;
pub use discovery::StaticDiscovery;
pub use dispatcher::Dispatcher;
pub use executor::{ExecutionOutput, LocalExecutor, ModelCatalog, PeerDiscovery, RemoteExecutor, TelemetrySource};
pub use fanout::{aggregate, AggregatedResponse, FanOutCoordinator};
pub use health::{HealthMonitor, MonitorHandles, MonitorSettings};
pub use node::{Node, NodeCapabilities, NodeDescriptor, NodeResources, NodeStatus};
pub use node_client::{BackendExecutor, GrpcNodeClient};
pub use orchestrator::{Collaborators, DistributedOrchestrator};
pub use pipeline::PipelineScheduler;
pub use placement::PlacementEngine;
pub use registry::NodeRegistry;
pub use request::{InferenceRequest, InferenceResponse};
pub use task::{DistributedTask, TaskStatus, TaskStore};
pub use telemetry::ProcTelemetry;
