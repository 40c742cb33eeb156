//! Dependency-ordered multi-stage inference
//!
//! Stages run in waves: every stage whose dependencies have all finished is
//! dispatched concurrently, and downstream stages receive upstream results
//! in their request metadata under [`DEPENDENCY_RESULTS_KEY`]. The wave plan
//! is computed before anything runs, so a dependency cycle fails the call
//! without dispatching a single stage.

use crate::dispatcher::Dispatcher;
use crate::request::{InferenceRequest, InferenceResponse, DEPENDENCY_RESULTS_KEY};
use futures::future::join_all;
use nodemesh_common::error::{MeshError, Result};
use nodemesh_common::{DistributionStrategy, METRICS};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub struct PipelineScheduler {
    dispatcher: Arc<Dispatcher>,
}

impl PipelineScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run `requests`, where `dependencies[i]` lists the stages that must
    /// finish before stage `i` starts
    ///
    /// A failed stage still counts as finished; its error entry is what its
    /// dependents receive. Results follow input order.
    pub async fn run_pipeline(
        &self,
        requests: Vec<InferenceRequest>,
        dependencies: Vec<Vec<usize>>,
        strategy: DistributionStrategy,
    ) -> Result<Vec<InferenceResponse>> {
        let waves = plan_waves(requests.len(), &dependencies)?;
        info!(stages = requests.len(), waves = waves.len(), "Running pipeline");

        let mut pending: Vec<Option<InferenceRequest>> = requests.into_iter().map(Some).collect();
        let mut results: Vec<Option<InferenceResponse>> = vec![None; pending.len()];

        for (wave_index, wave) in waves.iter().enumerate() {
            debug!(wave = wave_index, stages = ?wave, "Dispatching pipeline wave");
            METRICS.coordinator.pipeline_waves.inc();

            let mut stages = Vec::with_capacity(wave.len());
            for &index in wave {
                let mut request = pending[index]
                    .take()
                    .ok_or_else(|| MeshError::internal(format!("Stage {} scheduled twice", index)))?;
                if !dependencies[index].is_empty() {
                    inject_dependencies(&mut request, &dependencies[index], &results);
                }
                stages.push((index, request));
            }

            let runs = stages.into_iter().map(|(index, request)| async move {
                let model_id = request.model_id.clone();
                let response = match self.dispatcher.run_one(request, strategy).await {
                    Ok(response) => response,
                    Err(e) => InferenceResponse::failed(model_id, &e),
                };
                (index, response)
            });

            for (index, response) in join_all(runs).await {
                results[index] = Some(response);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.ok_or_else(|| MeshError::internal(format!("Stage {} never ran", index)))
            })
            .collect()
    }
}

/// Group stages into waves with Kahn's algorithm
///
/// Each wave holds the stages whose dependencies all sit in earlier waves,
/// in ascending index order.
fn plan_waves(stage_count: usize, dependencies: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    if dependencies.len() != stage_count {
        return Err(MeshError::invalid_input(format!(
            "Got {} requests but {} dependency lists",
            stage_count,
            dependencies.len()
        )));
    }

    let mut in_degree = vec![0usize; stage_count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stage_count];
    for (stage, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            if dep >= stage_count {
                return Err(MeshError::invalid_input(format!(
                    "Stage {} depends on unknown stage {}",
                    stage, dep
                )));
            }
            in_degree[stage] += 1;
            dependents[dep].push(stage);
        }
    }

    let mut waves = Vec::new();
    let mut ready: Vec<usize> = (0..stage_count).filter(|&i| in_degree[i] == 0).collect();
    let mut planned = 0;

    while !ready.is_empty() {
        let mut next = Vec::new();
        for &stage in &ready {
            for &dependent in &dependents[stage] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        planned += ready.len();
        waves.push(std::mem::replace(&mut ready, next));
    }

    if planned < stage_count {
        let blocked: Vec<usize> = (0..stage_count).filter(|&i| in_degree[i] > 0).collect();
        return Err(MeshError::circular_dependency(format!(
            "Stages {:?} can never become ready",
            blocked
        )));
    }

    Ok(waves)
}

/// Add upstream results to `request.metadata`, keyed by stage index
fn inject_dependencies(
    request: &mut InferenceRequest,
    deps: &[usize],
    results: &[Option<InferenceResponse>],
) {
    let injected = request
        .metadata
        .entry(DEPENDENCY_RESULTS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !injected.is_object() {
        *injected = Value::Object(Map::new());
    }

    if let Value::Object(map) = injected {
        for &dep in deps {
            if let Some(result) = &results[dep] {
                map.insert(dep.to_string(), result.dependency_summary());
            }
        }
    }
}
