//! Shared fixtures for unit tests

use crate::executor::{ExecutionOutput, LocalExecutor, PeerDiscovery, RemoteExecutor, TelemetrySource};
use crate::node::{NodeCapabilities, NodeDescriptor, NodeResources};
use crate::request::InferenceRequest;
use async_trait::async_trait;
use nodemesh_common::error::{MeshError, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) fn descriptor(id: &str) -> NodeDescriptor {
    descriptor_with_models(id, &[])
}

pub(crate) fn descriptor_with_models(id: &str, models: &[&str]) -> NodeDescriptor {
    NodeDescriptor {
        id: id.to_string(),
        hostname: format!("{}.local", id),
        address: format!("http://{}:50051", id),
        available_models: models.iter().map(|m| m.to_string()).collect(),
        capabilities: NodeCapabilities::default(),
    }
}

/// Scripted behaviour for one model
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Output(Value),
    Confident(Value, f64),
    Fail(String),
    Transport(String),
    Hang,
}

/// Executor double usable as both the local backend and the peer client
pub(crate) struct MockExecutor {
    replies: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Duration>,
    requests: Mutex<Vec<InferenceRequest>>,
    addresses: Mutex<Vec<String>>,
    unreachable: Mutex<HashSet<String>>,
    serving: AtomicBool,
    health_checks: AtomicUsize,
}

impl MockExecutor {
    pub(crate) fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            default_delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            addresses: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            serving: AtomicBool::new(true),
            health_checks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reply(&self, model_id: &str, reply: Reply) {
        self.replies.lock().insert(model_id.to_string(), reply);
    }

    pub(crate) fn delay(&self, model_id: &str, delay: Duration) {
        self.delays.lock().insert(model_id.to_string(), delay);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.default_delay.lock() = delay;
    }

    pub(crate) fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    /// Health checks against `address` fail with a transport error
    pub(crate) fn set_unreachable(&self, address: &str) {
        self.unreachable.lock().insert(address.to_string());
    }

    pub(crate) fn set_reachable(&self, address: &str) {
        self.unreachable.lock().remove(address);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }

    pub(crate) fn health_check_count(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    async fn run(&self, request: &InferenceRequest) -> Result<ExecutionOutput> {
        self.requests.lock().push(request.clone());

        let delay = self
            .delays
            .lock()
            .get(&request.model_id)
            .copied()
            .unwrap_or(*self.default_delay.lock());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .get(&request.model_id)
            .cloned()
            .unwrap_or_else(|| Reply::Output(json!(format!("output of {}", request.model_id))));

        let latency_ms = delay.as_secs_f64() * 1000.0 + 1.0;
        match reply {
            Reply::Output(output) => Ok(ExecutionOutput {
                output,
                latency_ms,
                confidence: None,
            }),
            Reply::Confident(output, confidence) => Ok(ExecutionOutput {
                output,
                latency_ms,
                confidence: Some(confidence),
            }),
            Reply::Fail(message) => Err(MeshError::model(message)),
            Reply::Transport(message) => Err(MeshError::transport(message)),
            Reply::Hang => std::future::pending::<Result<ExecutionOutput>>().await,
        }
    }
}

#[async_trait]
impl LocalExecutor for MockExecutor {
    async fn execute(&self, request: &InferenceRequest) -> Result<ExecutionOutput> {
        self.run(request).await
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute(&self, address: &str, request: &InferenceRequest) -> Result<ExecutionOutput> {
        self.addresses.lock().push(address.to_string());
        self.run(request).await
    }

    async fn health_check(&self, address: &str) -> Result<bool> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(address) {
            return Err(MeshError::transport(format!("{} unreachable", address)));
        }
        Ok(self.serving.load(Ordering::SeqCst))
    }
}

/// Discovery double returning whatever peers are currently set
#[derive(Default)]
pub(crate) struct MockDiscovery {
    peers: Mutex<Vec<NodeDescriptor>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockDiscovery {
    pub(crate) fn with_peers(peers: Vec<NodeDescriptor>) -> Self {
        Self {
            peers: Mutex::new(peers),
            ..Default::default()
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDiscovery for MockDiscovery {
    async fn discover(&self) -> Result<Vec<NodeDescriptor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeshError::transport("discovery backend unavailable"));
        }
        Ok(self.peers.lock().clone())
    }
}

/// Telemetry double with fixed readings
pub(crate) struct MockTelemetry {
    resources: NodeResources,
    capabilities: NodeCapabilities,
}

impl MockTelemetry {
    pub(crate) fn new(cpu_percent: f64, gpu_count: u32) -> Self {
        Self {
            resources: NodeResources {
                cpu_percent: Some(cpu_percent),
                memory_percent: Some(50.0),
                gpu_percent: None,
            },
            capabilities: NodeCapabilities {
                gpu_available: gpu_count > 0,
                gpu_count,
                cpu_count: 8,
                total_memory_bytes: 16 << 30,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetry {
    async fn snapshot(&self) -> Result<NodeResources> {
        Ok(self.resources.clone())
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.capabilities.clone()
    }
}
