//! gRPC client for node execution endpoints
//!
//! Used both for peers (`RemoteExecutor`) and for the model-serving backend
//! on this host (`LocalExecutor` via [`BackendExecutor`]).

use crate::executor::{ExecutionOutput, LocalExecutor, RemoteExecutor};
use crate::request::InferenceRequest;
use async_trait::async_trait;
use nodemesh_common::error::{MeshError, Result};
use nodemesh_proto::{ExecuteRequest, HealthCheckRequest, NodeServiceClient, NODE_SERVICE};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Client for node execution endpoints, one lazy channel per address
#[derive(Clone)]
pub struct GrpcNodeClient {
    clients: Arc<Mutex<HashMap<String, NodeServiceClient<Channel>>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcNodeClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout,
            request_timeout,
        }
    }

    /// Cached client for `address`; the channel connects on first use
    fn client(&self, address: &str) -> Result<NodeServiceClient<Channel>> {
        if let Some(client) = self.clients.lock().get(address) {
            return Ok(client.clone());
        }

        let channel = Endpoint::from_shared(address.to_string())
            .map_err(|e| MeshError::invalid_input(format!("Invalid node address {}: {}", address, e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .connect_lazy();
        let client = NodeServiceClient::new(channel);

        debug!(address = %address, "Created node client");
        Ok(self
            .clients
            .lock()
            .entry(address.to_string())
            .or_insert(client)
            .clone())
    }
}

#[async_trait]
impl RemoteExecutor for GrpcNodeClient {
    async fn execute(&self, address: &str, request: &InferenceRequest) -> Result<ExecutionOutput> {
        let mut client = self.client(address)?;

        let message = ExecuteRequest {
            model_id: request.model_id.clone(),
            inputs_json: serde_json::to_string(&request.inputs)?,
            parameters_json: serde_json::to_string(&request.parameters)?,
            metadata_json: serde_json::to_string(&request.metadata)?,
        };

        let response = client
            .execute(message)
            .await
            .map_err(status_to_error)?
            .into_inner();

        if !response.error.is_empty() {
            return Err(MeshError::model(response.error));
        }

        let output = if response.output_json.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&response.output_json)?
        };

        Ok(ExecutionOutput {
            output,
            latency_ms: response.latency_ms,
            confidence: response.confidence,
        })
    }

    async fn health_check(&self, address: &str) -> Result<bool> {
        let mut client = self.client(address)?;

        let response = client
            .health_check(HealthCheckRequest {
                service: NODE_SERVICE.to_string(),
            })
            .await
            .map_err(status_to_error)?;

        Ok(response.into_inner().serving)
    }
}

/// Local execution through the model-serving backend on this host
pub struct BackendExecutor {
    client: GrpcNodeClient,
    endpoint: String,
}

impl BackendExecutor {
    pub fn new(client: GrpcNodeClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LocalExecutor for BackendExecutor {
    async fn execute(&self, request: &InferenceRequest) -> Result<ExecutionOutput> {
        RemoteExecutor::execute(&self.client, &self.endpoint, request).await
    }
}

/// Split wire failures from failures reported by the model
fn status_to_error(status: tonic::Status) -> MeshError {
    match status.code() {
        tonic::Code::Unavailable
        | tonic::Code::DeadlineExceeded
        | tonic::Code::Cancelled
        | tonic::Code::Unknown => MeshError::transport(status.message().to_string()),
        _ => MeshError::model(status.message().to_string()),
    }
}
