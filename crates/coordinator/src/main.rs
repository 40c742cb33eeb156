//! NodeMesh Coordinator - Main Entry Point
//!
//! Registers this host as a node, starts discovery and liveness monitoring,
//! and runs until interrupted.

use anyhow::Context;
use nodemesh_common::{MeshConfig, METRICS};
use nodemesh_coordinator::{
    BackendExecutor, Collaborators, DistributedOrchestrator, GrpcNodeClient, ProcTelemetry,
    StaticDiscovery, StaticModelCatalog,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("NODEMESH_CONFIG")
        .unwrap_or_else(|_| "configs/coordinator-config.yaml".to_string());

    let from_file = Path::new(&config_path).exists();
    let config = if from_file {
        MeshConfig::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path))?
    } else {
        MeshConfig::from_env().context("failed to load configuration from environment")?
    };

    // Initialize logging
    let log_level = config
        .observability
        .as_ref()
        .map_or("info", |o| o.log_level.as_str());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("nodemesh_coordinator={0},nodemesh_common={0}", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting NodeMesh Coordinator");
    if !from_file {
        info!("{} not found, configured from environment", config_path);
    }

    let coordinator = &config.coordinator;
    info!(
        "Coordinator configuration loaded: bind={}:{}, peers={}, strategy={:?}",
        config.bind_address,
        config.port,
        coordinator.peers.len(),
        coordinator.default_strategy
    );

    // Collaborators
    let client = GrpcNodeClient::new(CONNECT_TIMEOUT, config.request_timeout());
    let discovery = match coordinator.discovery_method.as_str() {
        "static" => StaticDiscovery::from_config(&coordinator.peers),
        _ => StaticDiscovery::default(),
    };

    let collaborators = Collaborators {
        local: Arc::new(BackendExecutor::new(
            client.clone(),
            coordinator.local_backend_endpoint.clone(),
        )),
        remote: Arc::new(client),
        discovery: Arc::new(discovery),
        telemetry: Arc::new(ProcTelemetry::new(config.node.gpu_count)),
        catalog: Arc::new(StaticModelCatalog::new(coordinator.gpu_models.iter().cloned())),
    };

    let orchestrator = DistributedOrchestrator::new(&config, collaborators)
        .context("failed to initialize orchestrator")?;
    orchestrator.start();

    info!(node_id = %orchestrator.local_node_id(), "NodeMesh Coordinator running");

    // Wait for shutdown signal
    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    orchestrator.shutdown().await;

    if config.observability.as_ref().map_or(false, |o| o.enable_metrics) {
        debug!("Final metrics:\n{}", METRICS.gather());
    }

    info!("NodeMesh Coordinator shutdown complete");
    Ok(())
}
