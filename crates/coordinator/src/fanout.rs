//! Fan-out across models and batch spreading across nodes

use crate::dispatcher::Dispatcher;
use crate::request::{InferenceRequest, InferenceResponse};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use nodemesh_common::error::{MeshError, Result};
use nodemesh_common::{AggregationStrategy, DistributionStrategy, METRICS};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Separator between ensemble contributions
pub const ENSEMBLE_SEPARATOR: &str = "\n\n";

/// Combined result of a fan-out call
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "strategy", content = "result", rename_all = "snake_case")]
pub enum AggregatedResponse {
    First(InferenceResponse),
    All(Vec<InferenceResponse>),
    Vote {
        output: Value,
        confidence: f64,
        votes: usize,
        total: usize,
    },
    WeightedAverage {
        value: f64,
        contributors: usize,
    },
    Ensemble {
        output: String,
        contributors: Vec<String>,
    },
}

pub struct FanOutCoordinator {
    dispatcher: Arc<Dispatcher>,
}

impl FanOutCoordinator {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run `base` against every model concurrently
    ///
    /// Results follow `model_ids` order; failed branches are error entries.
    pub async fn run_parallel(
        &self,
        base: &InferenceRequest,
        model_ids: &[String],
        strategy: DistributionStrategy,
    ) -> Vec<InferenceResponse> {
        let branches = model_ids.iter().map(|model_id| {
            let request = base.for_model(model_id.as_str());
            async move {
                match self.dispatcher.run_one(request, strategy).await {
                    Ok(response) => response,
                    Err(e) => InferenceResponse::failed(model_id.as_str(), &e),
                }
            }
        });

        join_all(branches).await
    }

    /// Fan out and combine the results with `aggregation`
    pub async fn run_parallel_aggregated(
        &self,
        base: &InferenceRequest,
        model_ids: &[String],
        strategy: DistributionStrategy,
        aggregation: AggregationStrategy,
    ) -> Result<AggregatedResponse> {
        if model_ids.is_empty() {
            return Err(MeshError::invalid_input("Parallel inference needs at least one model"));
        }

        info!(models = model_ids.len(), ?aggregation, "Running parallel inference");

        if aggregation == AggregationStrategy::FirstResponse {
            return self.race(base, model_ids, strategy).await;
        }

        let results = self.run_parallel(base, model_ids, strategy).await;
        aggregate(&results, aggregation)
    }

    /// First successful branch wins; dropping the rest cancels them
    async fn race(
        &self,
        base: &InferenceRequest,
        model_ids: &[String],
        strategy: DistributionStrategy,
    ) -> Result<AggregatedResponse> {
        let mut pending: FuturesUnordered<_> = model_ids
            .iter()
            .map(|model_id| self.dispatcher.run_one(base.for_model(model_id.as_str()), strategy))
            .collect();

        let mut failures = Vec::new();
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(response) => {
                    debug!(
                        model_id = %response.model_id,
                        remaining = pending.len(),
                        "First response received"
                    );
                    return Ok(AggregatedResponse::First(response));
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        METRICS.coordinator.aggregation_failures.inc();
        Err(MeshError::aggregation(format!(
            "All {} branches failed: {}",
            failures.len(),
            failures.join("; ")
        )))
    }

    /// Spread `requests` over nodes, one placement call per model
    ///
    /// Requests for the same model are assigned index-modulo over the node
    /// list returned for that model. Results follow input order.
    pub async fn run_batch(
        &self,
        requests: Vec<InferenceRequest>,
        strategy: DistributionStrategy,
    ) -> Result<Vec<InferenceResponse>> {
        let mut by_model: Vec<(String, Vec<usize>)> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, request) in requests.iter().enumerate() {
            let slot = *positions.entry(request.model_id.as_str()).or_insert_with(|| {
                by_model.push((request.model_id.clone(), Vec::new()));
                by_model.len() - 1
            });
            by_model[slot].1.push(index);
        }

        let mut assignments = vec![String::new(); requests.len()];
        for (model_id, indices) in &by_model {
            let nodes = self
                .dispatcher
                .placement()
                .select_nodes_for_batch(model_id, indices.len(), strategy)
                .await;
            if nodes.is_empty() {
                return Err(MeshError::no_suitable_node(format!(
                    "No suitable node found for model {}",
                    model_id
                )));
            }

            for (position, &index) in indices.iter().enumerate() {
                assignments[index] = nodes[position % nodes.len()].clone();
            }
        }

        info!(requests = requests.len(), models = by_model.len(), "Running batch inference");

        let runs = requests.into_iter().zip(assignments).map(|(request, node_id)| async move {
            let model_id = request.model_id.clone();
            match self.dispatcher.run_on_node(request, &node_id).await {
                Ok(response) => response,
                Err(e) => InferenceResponse::failed(model_id, &e),
            }
        });

        Ok(join_all(runs).await)
    }
}

/// Combine fan-out results
///
/// Error entries never contribute, but a majority vote still counts them
/// in its total, so confidence is the winning group's share of every
/// result. `FirstResponse` over an already collected set picks the first
/// successful entry in order.
pub fn aggregate(results: &[InferenceResponse], strategy: AggregationStrategy) -> Result<AggregatedResponse> {
    let ok: Vec<&InferenceResponse> = results.iter().filter(|r| !r.is_error()).collect();
    if ok.is_empty() {
        METRICS.coordinator.aggregation_failures.inc();
        return Err(MeshError::aggregation(format!(
            "All {} results failed",
            results.len()
        )));
    }

    let aggregated = match strategy {
        AggregationStrategy::FirstResponse => Ok(AggregatedResponse::First(ok[0].clone())),
        AggregationStrategy::AllResponses => {
            Ok(AggregatedResponse::All(ok.into_iter().cloned().collect()))
        }
        AggregationStrategy::MajorityVote => Ok(majority_vote(&ok, results.len())),
        AggregationStrategy::WeightedAverage => weighted_average(&ok),
        AggregationStrategy::Ensemble => Ok(ensemble(&ok)),
    };

    if aggregated.is_err() {
        METRICS.coordinator.aggregation_failures.inc();
    }
    aggregated
}

fn majority_vote(results: &[&InferenceResponse], total: usize) -> AggregatedResponse {
    // (text, representative, votes) in first-seen order
    let mut groups: Vec<(String, &InferenceResponse, usize)> = Vec::new();
    for result in results {
        let text = result.output_text();
        match groups.iter_mut().find(|(key, _, _)| *key == text) {
            Some(group) => group.2 += 1,
            None => groups.push((text, result, 1)),
        }
    }

    // Strictly greater keeps the earliest group on ties.
    let mut winner = &groups[0];
    for group in &groups[1..] {
        if group.2 > winner.2 {
            winner = group;
        }
    }

    AggregatedResponse::Vote {
        output: winner.1.output.clone(),
        confidence: winner.2 as f64 / total as f64,
        votes: winner.2,
        total,
    }
}

fn weighted_average(results: &[&InferenceResponse]) -> Result<AggregatedResponse> {
    let samples: Vec<(f64, f64)> = results
        .iter()
        .filter_map(|r| {
            let value = r.output_number()?;
            let weight = r
                .confidence
                .unwrap_or_else(|| 1.0 / r.latency_ms.unwrap_or(1.0).max(1.0));
            Some((value, weight))
        })
        .collect();

    if samples.is_empty() {
        return Err(MeshError::aggregation("No numeric outputs to average"));
    }

    let total_weight: f64 = samples.iter().map(|(_, w)| w).sum();
    let value = if total_weight > 0.0 {
        samples.iter().map(|(v, w)| v * w / total_weight).sum()
    } else {
        warn!("All weights are zero, using the plain mean");
        samples.iter().map(|(v, _)| v).sum::<f64>() / samples.len() as f64
    };

    Ok(AggregatedResponse::WeightedAverage {
        value,
        contributors: samples.len(),
    })
}

fn ensemble(results: &[&InferenceResponse]) -> AggregatedResponse {
    let output = results
        .iter()
        .map(|r| format!("[{}]\n{}", r.model_id, r.output_text()))
        .collect::<Vec<_>>()
        .join(ENSEMBLE_SEPARATOR);

    AggregatedResponse::Ensemble {
        output,
        contributors: results.iter().map(|r| r.model_id.clone()).collect(),
    }
}
