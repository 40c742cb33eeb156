//! Model metadata for placement

use crate::executor::ModelCatalog;
use async_trait::async_trait;
use std::collections::HashSet;

/// Catalog backed by a fixed list of GPU-capable model ids
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    gpu_models: HashSet<String>,
}

impl StaticModelCatalog {
    pub fn new<I, S>(gpu_models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gpu_models: gpu_models.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ModelCatalog for StaticModelCatalog {
    async fn supports_gpu(&self, model_id: &str) -> bool {
        self.gpu_models.contains(model_id)
    }
}
