//! Common error types for NodeMesh
//!
//! This module defines all error types used across the NodeMesh system.
//! All errors are convertible to gRPC status codes for proper error propagation.

use thiserror::Error;

/// Main error type for NodeMesh
#[derive(Error, Debug)]
pub enum MeshError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC communication errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// Network-level failure talking to a peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Model-level failure reported by an execution backend
    #[error("Model error: {0}")]
    Model(String),

    /// Placement found no candidate node
    #[error("No suitable node: {0}")]
    NoSuitableNode(String),

    /// A peer stopped reporting heartbeats
    #[error("Node timed out: {0}")]
    NodeTimeout(String),

    /// Execution on a remote node failed
    #[error("Remote execution failed on node {node_id}: {source}")]
    RemoteExecution {
        node_id: String,
        #[source]
        source: Box<MeshError>,
    },

    /// Pipeline dependency graph contains a cycle
    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    /// Fan-out results could not be combined
    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    /// Task is already in a terminal state
    #[error("Task not cancellable: {0}")]
    NotCancellable(String),

    /// Task was cancelled before it finished
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// Unknown node or task
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for MeshError {
    fn from(err: config::ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}

impl MeshError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            MeshError::Grpc(status) => status.clone(),
            MeshError::GrpcTransport(_) => tonic::Status::unavailable("Transport error"),
            MeshError::Transport(msg) => {
                tonic::Status::unavailable(format!("Transport error: {}", msg))
            }
            MeshError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            MeshError::Model(msg) => tonic::Status::internal(format!("Model error: {}", msg)),
            MeshError::NoSuitableNode(msg) => {
                tonic::Status::unavailable(format!("No suitable node: {}", msg))
            }
            MeshError::NodeTimeout(msg) => {
                tonic::Status::unavailable(format!("Node timed out: {}", msg))
            }
            MeshError::RemoteExecution { source, .. } => source.to_status(),
            MeshError::CircularDependency(msg) => {
                tonic::Status::invalid_argument(format!("Circular dependency: {}", msg))
            }
            MeshError::Aggregation(msg) => {
                tonic::Status::failed_precondition(format!("Aggregation failed: {}", msg))
            }
            MeshError::NotCancellable(msg) => {
                tonic::Status::failed_precondition(format!("Task not cancellable: {}", msg))
            }
            MeshError::Cancelled(msg) => tonic::Status::cancelled(format!("Cancelled: {}", msg)),
            MeshError::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            MeshError::InvalidInput(msg) => {
                tonic::Status::invalid_argument(format!("Invalid input: {}", msg))
            }
            MeshError::Timeout(msg) => {
                tonic::Status::deadline_exceeded(format!("Timeout: {}", msg))
            }
            MeshError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            MeshError::Parse(msg) => {
                tonic::Status::invalid_argument(format!("Parse error: {}", msg))
            }
            MeshError::Serialization(err) => {
                tonic::Status::internal(format!("Serialization error: {}", err))
            }
            MeshError::Internal(msg) => {
                tonic::Status::internal(format!("Internal error: {}", msg))
            }
        }
    }

    /// Whether this failure happened on the wire rather than inside a model
    pub fn is_transport(&self) -> bool {
        match self {
            MeshError::GrpcTransport(_) | MeshError::Transport(_) | MeshError::Timeout(_) => true,
            MeshError::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
            ),
            MeshError::RemoteExecution { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        MeshError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        MeshError::Model(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        MeshError::Transport(msg.into())
    }

    /// Create a no-suitable-node error
    pub fn no_suitable_node(msg: impl Into<String>) -> Self {
        MeshError::NoSuitableNode(msg.into())
    }

    /// Wrap a failure that happened while executing on `node_id`
    pub fn remote_execution(node_id: impl Into<String>, source: MeshError) -> Self {
        MeshError::RemoteExecution {
            node_id: node_id.into(),
            source: Box::new(source),
        }
    }

    /// Create a circular dependency error
    pub fn circular_dependency(msg: impl Into<String>) -> Self {
        MeshError::CircularDependency(msg.into())
    }

    /// Create an aggregation error
    pub fn aggregation(msg: impl Into<String>) -> Self {
        MeshError::Aggregation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        MeshError::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        MeshError::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        MeshError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        MeshError::Internal(msg.into())
    }
}

/// Result type alias for NodeMesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
