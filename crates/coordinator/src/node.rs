//! Compute node records
//!
//! A node is a peer (or the local process) able to execute inference
//! requests. Identity and capabilities change rarely; status, telemetry and
//! the task counters are updated continuously.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Smoothing factor for the response time moving average
pub const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Liveness state of a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Error,
}

/// Static hardware description, set at registration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub gpu_available: bool,

    #[serde(default)]
    pub gpu_count: u32,

    #[serde(default)]
    pub cpu_count: u32,

    #[serde(default)]
    pub total_memory_bytes: u64,

    /// Anything else the node chose to advertise
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Live resource telemetry, all values in percent
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeResources {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub gpu_percent: Option<f64>,
}

impl NodeResources {
    /// Overwrite the fields present in `update`, keep the rest
    pub fn merge(&mut self, update: &NodeResources) {
        if update.cpu_percent.is_some() {
            self.cpu_percent = update.cpu_percent;
        }
        if update.memory_percent.is_some() {
            self.memory_percent = update.memory_percent;
        }
        if update.gpu_percent.is_some() {
            self.gpu_percent = update.gpu_percent;
        }
    }
}

/// Identity of a node as reported by registration or discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub available_models: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

/// Full node state tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub status: NodeStatus,

    /// Empty means "unknown, assume capable"
    pub available_models: BTreeSet<String>,
    pub capabilities: NodeCapabilities,
    pub resources: NodeResources,
    pub last_heartbeat: DateTime<Utc>,

    /// In-flight tasks assigned to this node
    pub current_tasks: u32,

    /// Tasks that reached a terminal state on this node
    pub total_tasks_processed: u64,

    /// Moving average of completed task latency
    pub average_response_time_ms: Option<f64>,

    /// Set when the liveness sweep took the node offline, so only those
    /// nodes are restored by a successful probe
    #[serde(skip)]
    pub(crate) expired_by_sweep: bool,
}

impl Node {
    /// Create an online node from its descriptor
    pub fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            id: descriptor.id,
            hostname: descriptor.hostname,
            address: descriptor.address,
            status: NodeStatus::Online,
            available_models: descriptor.available_models,
            capabilities: descriptor.capabilities,
            resources: NodeResources::default(),
            last_heartbeat: Utc::now(),
            current_tasks: 0,
            total_tasks_processed: 0,
            average_response_time_ms: None,
            expired_by_sweep: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// Whether the node advertises `model_id` explicitly
    pub fn has_model(&self, model_id: &str) -> bool {
        self.available_models.contains(model_id)
    }

    /// Fold a completed task's latency into the moving average
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.average_response_time_ms = Some(match self.average_response_time_ms {
            Some(previous) => RESPONSE_TIME_ALPHA * latency_ms + (1.0 - RESPONSE_TIME_ALPHA) * previous,
            None => latency_ms,
        });
    }

    pub(crate) fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}
