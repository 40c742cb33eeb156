//! NodeMesh common library
//!
//! This crate contains shared code used across NodeMesh components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{AggregationStrategy, DistributionStrategy, MeshConfig};
pub use error::{MeshError, Result};
pub use metrics::{MetricsRegistry, METRICS};
