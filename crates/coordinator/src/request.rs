//! Inference request and response records
//!
//! Payloads are opaque JSON; the coordinator only looks at `model_id`,
//! the metadata map (pipeline dependency injection) and the result
//! bookkeeping fields.

use nodemesh_common::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key under which pipeline stages receive upstream outputs
pub const DEPENDENCY_RESULTS_KEY: &str = "dependency_results";

/// A request for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model_id: String,

    /// Model inputs
    #[serde(default)]
    pub inputs: Value,

    /// Generation parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            model_id: model_id.into(),
            inputs,
            parameters: Map::new(),
            metadata: Map::new(),
        }
    }

    /// Same payload, different model
    pub fn for_model(&self, model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            inputs: self.inputs.clone(),
            parameters: self.parameters.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Outcome of one request
///
/// Fan-out and pipeline calls never abort on a single failure; failed
/// branches come back as responses with `error` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_id: String,

    #[serde(default)]
    pub output: Value,

    pub node_id: Option<String>,
    pub task_id: Option<String>,

    /// Latency reported by the executing backend
    pub latency_ms: Option<f64>,

    /// Confidence reported by the model, if any
    pub confidence: Option<f64>,

    pub error: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InferenceResponse {
    /// Error entry for a branch that failed
    pub fn failed(model_id: impl Into<String>, error: &MeshError) -> Self {
        Self {
            model_id: model_id.into(),
            output: Value::Null,
            node_id: None,
            task_id: None,
            latency_ms: None,
            confidence: None,
            error: Some(error.to_string()),
            metadata: Map::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Output rendered as text; strings are taken verbatim
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Output parsed as a number, if it is one
    pub fn output_number(&self) -> Option<f64> {
        match &self.output {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Summary injected into downstream pipeline stages
    pub(crate) fn dependency_summary(&self) -> Value {
        serde_json::json!({
            "model_id": self.model_id,
            "output": self.output,
            "error": self.error,
        })
    }
}
