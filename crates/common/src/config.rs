//! Configuration structures for NodeMesh
//!
//! This module defines all configuration types used by the coordinator.
//! Configurations are loaded from YAML files and can be overridden by environment variables.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `NODEMESH_COORDINATOR__HEARTBEAT_TIMEOUT_SECS`
pub const ENV_PREFIX: &str = "NODEMESH";

/// Top-level configuration for NodeMesh components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity of the local node
    #[serde(default)]
    pub node: LocalNodeConfig,

    /// Coordinator-specific configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Local node identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Fixed node id (a random one is generated when absent)
    pub node_id: Option<String>,

    /// Hostname reported to peers (defaults to `$HOSTNAME`)
    pub hostname: Option<String>,

    /// Address peers use to reach this node
    #[serde(default)]
    pub address: String,

    /// Models already loaded on this node
    #[serde(default)]
    pub available_models: Vec<String>,

    /// Number of GPUs usable by the local backend
    #[serde(default)]
    pub gpu_count: u32,
}

/// Statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id
    pub id: String,

    /// Peer execution endpoint
    pub address: String,

    /// Informational hostname
    pub hostname: Option<String>,

    /// Models known to be loaded on the peer
    #[serde(default)]
    pub models: Vec<String>,

    /// Whether the peer has a GPU
    #[serde(default)]
    pub gpu_available: bool,
}

/// Coordinator-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Statically known peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Peer discovery method
    #[serde(default = "default_discovery_method")]
    pub discovery_method: String,

    /// Discovery interval in seconds
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Discovery retry delay after a failed round, in seconds
    #[serde(default = "default_discovery_retry")]
    pub discovery_retry_secs: u64,

    /// Peers silent for longer than this are marked offline
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Liveness sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Local telemetry refresh interval in seconds
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,

    /// Probe peers with a health check before expiring them
    #[serde(default = "default_probe_peers")]
    pub probe_peers: bool,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Endpoint of the model-serving backend on this host
    #[serde(default = "default_local_backend_endpoint")]
    pub local_backend_endpoint: String,

    /// Models that benefit from GPU placement
    #[serde(default)]
    pub gpu_models: Vec<String>,

    /// Placement strategy used when the caller does not pick one
    #[serde(default)]
    pub default_strategy: DistributionStrategy,

    /// Aggregation used for parallel inference when the caller does not pick one
    #[serde(default)]
    pub default_aggregation: AggregationStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            discovery_method: default_discovery_method(),
            discovery_interval_secs: default_discovery_interval(),
            discovery_retry_secs: default_discovery_retry(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            telemetry_interval_secs: default_telemetry_interval(),
            probe_peers: default_probe_peers(),
            request_timeout_secs: default_request_timeout(),
            local_backend_endpoint: default_local_backend_endpoint(),
            gpu_models: Vec::new(),
            default_strategy: DistributionStrategy::default(),
            default_aggregation: AggregationStrategy::default(),
        }
    }
}

/// Node placement strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Rotate through candidates
    RoundRobin,

    /// Fewest in-flight tasks
    #[default]
    LeastLoaded,

    /// GPU nodes for GPU models, otherwise least CPU usage
    CapabilityBased,

    /// Lowest average response time
    LatencyOptimized,
}

/// Fan-out result aggregation strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// First successful branch wins, the rest are cancelled
    FirstResponse,

    /// Every successful result, in caller order
    #[default]
    AllResponses,

    /// Most frequent output
    MajorityVote,

    /// Confidence- or latency-weighted mean of numeric outputs
    WeightedAverage,

    /// Concatenation of every output, tagged by model
    Ensemble,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50050
}

fn default_discovery_method() -> String {
    "static".to_string()
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_discovery_retry() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_telemetry_interval() -> u64 {
    5
}

fn default_probe_peers() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_local_backend_endpoint() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl MeshConfig {
    /// Load configuration from a YAML file, with `NODEMESH_*` environment overrides
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(MeshError::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                MeshError::Config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;

        let config: MeshConfig = settings.try_deserialize().map_err(|e| {
            MeshError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: MeshConfig = serde_yaml::from_str(content)
            .map_err(|e| MeshError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: MeshConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.node.node_id {
            if id.trim().is_empty() {
                return Err(MeshError::config("node.node_id must not be empty"));
            }
        }

        let c = &self.coordinator;
        let intervals = [
            ("discovery_interval_secs", c.discovery_interval_secs),
            ("discovery_retry_secs", c.discovery_retry_secs),
            ("heartbeat_timeout_secs", c.heartbeat_timeout_secs),
            ("sweep_interval_secs", c.sweep_interval_secs),
            ("telemetry_interval_secs", c.telemetry_interval_secs),
            ("request_timeout_secs", c.request_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(MeshError::config(format!("coordinator.{} must be > 0", name)));
            }
        }

        if c.heartbeat_timeout_secs <= c.telemetry_interval_secs {
            return Err(MeshError::config(format!(
                "heartbeat_timeout_secs ({}) must exceed telemetry_interval_secs ({})",
                c.heartbeat_timeout_secs, c.telemetry_interval_secs
            )));
        }

        match c.discovery_method.as_str() {
            "static" | "none" => {}
            other => {
                return Err(MeshError::config(format!("Invalid discovery method: {}", other)));
            }
        }

        for peer in &c.peers {
            if peer.id.trim().is_empty() || peer.address.trim().is_empty() {
                return Err(MeshError::config("Peers need a non-empty id and address"));
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.request_timeout_secs)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            node: LocalNodeConfig::default(),
            coordinator: CoordinatorConfig::default(),
            observability: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MeshConfig::from_yaml_str("port: 6000\n").unwrap();

        assert_eq!(config.port, 6000);
        assert_eq!(config.coordinator.discovery_interval_secs, 60);
        assert_eq!(config.coordinator.discovery_retry_secs, 10);
        assert_eq!(config.coordinator.heartbeat_timeout_secs, 120);
        assert_eq!(config.coordinator.telemetry_interval_secs, 5);
        assert_eq!(config.coordinator.default_strategy, DistributionStrategy::LeastLoaded);
        assert_eq!(config.coordinator.default_aggregation, AggregationStrategy::AllResponses);
    }

    #[test]
    fn test_config_peers_and_strategy() {
        let yaml = r#"
node:
  node_id: local-1
  address: http://10.0.0.1:50051
  gpu_count: 2
coordinator:
  default_strategy: latency_optimized
  gpu_models: [llama-7b]
  peers:
    - id: peer-a
      address: http://10.0.0.2:50051
      models: [llama-7b, whisper-small]
      gpu_available: true
"#;
        let config = MeshConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.node.node_id.as_deref(), Some("local-1"));
        assert_eq!(config.coordinator.peers.len(), 1);
        assert!(config.coordinator.peers[0].gpu_available);
        assert_eq!(
            config.coordinator.default_strategy,
            DistributionStrategy::LatencyOptimized
        );
    }

    #[test]
    fn test_config_validation_rejects_short_heartbeat() {
        let mut config = MeshConfig::default();
        config.coordinator.heartbeat_timeout_secs = 5;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_empty_peer() {
        let mut config = MeshConfig::default();
        config.coordinator.peers.push(PeerConfig {
            id: "".to_string(),
            address: "http://10.0.0.2:50051".to_string(),
            hostname: None,
            models: vec![],
            gpu_available: false,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_unknown_discovery() {
        let mut config = MeshConfig::default();
        config.coordinator.discovery_method = "mdns".to_string();

        assert!(config.validate().is_err());
    }
}
