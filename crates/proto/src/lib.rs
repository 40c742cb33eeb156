//! NodeMesh Protocol Buffers
//!
//! Wire messages and client for the per-node execution service
//! (`nodemesh.node.NodeService`). Messages are declared with prost derives
//! instead of being generated from `.proto` files, so the crate builds
//! without `protoc`.

use serde::{Deserialize, Serialize};

/// Fully qualified gRPC service name
pub const NODE_SERVICE: &str = "nodemesh.node.NodeService";

/// Run one inference request on a node
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct ExecuteRequest {
    #[prost(string, tag = "1")]
    pub model_id: ::prost::alloc::string::String,
    /// JSON-encoded model inputs
    #[prost(string, tag = "2")]
    pub inputs_json: ::prost::alloc::string::String,
    /// JSON-encoded generation parameters
    #[prost(string, tag = "3")]
    pub parameters_json: ::prost::alloc::string::String,
    /// JSON-encoded request metadata (carries pipeline dependency results)
    #[prost(string, tag = "4")]
    pub metadata_json: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct ExecuteResponse {
    /// JSON-encoded model output
    #[prost(string, tag = "1")]
    pub output_json: ::prost::alloc::string::String,
    /// Time spent by the node executing the request
    #[prost(double, tag = "2")]
    pub latency_ms: f64,
    #[prost(double, optional, tag = "3")]
    pub confidence: ::core::option::Option<f64>,
    /// Non-empty when the model itself rejected the request
    #[prost(string, tag = "4")]
    pub error: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(bool, tag = "1")]
    pub serving: bool,
}

pub mod node_service_client {
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::{Body, Bytes, StdError};

    /// Unary client for the node execution service
    #[derive(Debug, Clone)]
    pub struct NodeServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl NodeServiceClient<tonic::transport::Channel> {
        /// Connect to a node endpoint
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> NodeServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        /// Execute a request on the node
        pub async fn execute(
            &mut self,
            request: impl tonic::IntoRequest<super::ExecuteRequest>,
        ) -> Result<tonic::Response<super::ExecuteResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unavailable(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/nodemesh.node.NodeService/Execute");
            self.inner.unary(request.into_request(), path, codec).await
        }

        /// Ask the node whether it is serving
        pub async fn health_check(
            &mut self,
            request: impl tonic::IntoRequest<super::HealthCheckRequest>,
        ) -> Result<tonic::Response<super::HealthCheckResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unavailable(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/nodemesh.node.NodeService/HealthCheck");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}

pub use node_service_client::NodeServiceClient;
