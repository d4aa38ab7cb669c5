//! Candidate generation and flow ranking.
//!
//! One request runs five stages in order: plan, dispatch, normalize, score,
//! select. Only missing configuration is an error; failed calls, empty
//! generations and embedding failures are absorbed and show up in
//! `meta.dropped` or the logs.

pub mod dispatch;
pub mod normalize;
pub mod plan;
pub mod score;
pub mod select;
pub mod similarity;
pub mod trace;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::gateway::{Attribution, GenerationGateway};
use crate::tokens::count_tokens;

use dispatch::{dispatch, estimate_avg_log_prob, DispatchOutcome};
use normalize::clean_generations;
use plan::{build_plan, DecodingPlan, EntropySource, RandomSource};
use score::score_candidates;
use select::{select, SelectionBounds};
use similarity::Similarity;
use trace::{hash_input, now_epoch_ms, CallTrace, TraceSink};

pub use types::*;

/// Model id reported for offline ranking runs.
pub const OFFLINE_MODEL_ID: &str = "offline";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub struct CandidateEngine {
    gateway: Arc<dyn GenerationGateway>,
    similarity: Similarity,
    random: Arc<dyn RandomSource>,
    weights: FlowWeights,
    trace: Option<Arc<dyn TraceSink>>,
}

impl CandidateEngine {
    pub fn new(gateway: Arc<dyn GenerationGateway>) -> Self {
        Self {
            gateway,
            similarity: Similarity::Lexical,
            random: Arc::new(EntropySource),
            weights: FlowWeights::default(),
            trace: None,
        }
    }

    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_weights(mut self, weights: FlowWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// The decoding plan a request would run with.
    pub fn plan(&self, req: &GenerationRequest) -> DecodingPlan {
        build_plan(req, self.random.as_ref())
    }

    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, EngineError> {
        self.gateway
            .ensure_configured()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let run_id = Uuid::new_v4();
        let plan = self.plan(req);
        let bounds = SelectionBounds::from_request(req);

        let dispatched = dispatch(self.gateway.as_ref(), req, &plan, run_id).await;
        let attempted = dispatched.attempted();
        let failed = dispatched.failed();
        let cleaned = clean_generations(dispatched.generations());
        self.record_traces(run_id, &plan, &dispatched, &cleaned);

        let ranked = rank_cleaned(
            cleaned,
            req.last_user_utterance(),
            &self.similarity,
            &self.weights,
            &bounds,
            Attribution::new("engine::score").with_run(run_id),
        )
        .await;
        let dropped = dropped_count(attempted, ranked.scored, ranked.candidates.len());

        tracing::info!(
            run_id = %run_id,
            attempted,
            failed,
            scored = ranked.scored,
            selected = ranked.candidates.len(),
            dropped,
            semantic = self.similarity.is_semantic(),
            "Candidate generation finished"
        );

        Ok(GenerationResponse {
            meta: ResponseMeta {
                run_id,
                model_id: self.gateway.model_id().to_string(),
                used_k: ranked.candidates.len(),
                dropped,
                attempted_calls: attempted,
                failed_calls: failed,
                params: RunParams {
                    calls: plan.calls.iter().map(|c| c.summary()).collect(),
                    min_return: bounds.min_return,
                    max_return: bounds.max_return,
                    prefer_count: bounds.prefer_count,
                    coverage_target: ranked.coverage_target,
                    weights: self.weights,
                },
            },
            candidates: ranked.candidates,
        })
    }

    fn record_traces(
        &self,
        run_id: Uuid,
        plan: &DecodingPlan,
        dispatched: &DispatchOutcome,
        cleaned: &[RawGeneration],
    ) {
        let Some(sink) = self.trace.as_ref() else {
            return;
        };
        let survivors: HashSet<usize> = cleaned.iter().map(|g| g.call_index).collect();
        let model = self.gateway.model_id().to_string();

        for (planned, outcome) in plan.calls.iter().zip(&dispatched.outcomes) {
            let (token_count, avg_log_prob, error_code, error) = match &outcome.result {
                Ok(g) => (Some(g.token_count), Some(g.avg_log_prob), None, None),
                Err(e) => (None, None, Some(e.code().to_string()), Some(e.to_string())),
            };
            let event = CallTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: run_id.to_string(),
                call_index: planned.call_index,
                seed: planned.seed,
                variant_tag: planned.variant_tag,
                instruction: planned.instruction.clone(),
                input_hash: hash_input(&outcome.input),
                model: model.clone(),
                temperature: planned.params.temperature,
                top_p: planned.params.top_p,
                top_k: planned.params.top_k,
                max_new_tokens: planned.params.max_new_tokens,
                latency_ms: outcome.latency_ms,
                token_count,
                avg_log_prob,
                emptied: outcome.result.is_ok() && !survivors.contains(&planned.call_index),
                error_code,
                error,
            };
            if let Err(e) = sink.record(event) {
                tracing::warn!(error = %e, "Failed to record call trace");
            }
        }
    }
}

struct Ranked {
    candidates: Vec<Candidate>,
    scored: usize,
    coverage_target: Option<f64>,
}

async fn rank_cleaned(
    cleaned: Vec<RawGeneration>,
    last_user: &str,
    similarity: &Similarity,
    weights: &FlowWeights,
    bounds: &SelectionBounds,
    attribution: Attribution,
) -> Ranked {
    let scored = score_candidates(cleaned, last_user, similarity, weights, attribution).await;
    let scored_len = scored.len();
    let selection = select(scored, bounds);
    tracing::debug!(
        scored = scored_len,
        selected = selection.candidates.len(),
        coverage = ?selection.coverage_target,
        "Selection finished"
    );
    Ranked {
        candidates: selection
            .candidates
            .into_iter()
            .map(|c| c.into_candidate(*weights))
            .collect(),
        scored: scored_len,
        coverage_target: selection.coverage_target,
    }
}

/// `(attempted - cleaned) + (scored - selected)`; every scored candidate
/// survived cleaning, so `scored` is the cleaned count.
fn dropped_count(attempted: usize, scored: usize, selected: usize) -> usize {
    attempted.saturating_sub(scored) + scored.saturating_sub(selected)
}

/// Normalize, score and select texts generated elsewhere.
pub async fn rank_generations(
    req: &RankRequest,
    similarity: &Similarity,
    weights: FlowWeights,
) -> GenerationResponse {
    let run_id = Uuid::new_v4();
    let bounds = SelectionBounds::new(
        req.min_return,
        req.max_return,
        req.prefer_count,
        req.coverage_target,
    );

    let raw: Vec<RawGeneration> = req
        .generations
        .iter()
        .enumerate()
        .map(|(i, g)| RawGeneration {
            text: g.text.clone(),
            token_count: g.token_count.unwrap_or_else(|| count_tokens(&g.text)),
            avg_log_prob: g
                .avg_log_prob
                .filter(|lp| lp.is_finite())
                .unwrap_or_else(|| estimate_avg_log_prob(&g.text)),
            seed: g.seed.unwrap_or(i as u32),
            call_index: i,
            variant_tag: VariantTag::for_index(i),
        })
        .collect();
    let attempted = raw.len();

    let ranked = rank_cleaned(
        clean_generations(raw),
        last_user_utterance(&req.prompt, &req.context),
        similarity,
        &weights,
        &bounds,
        Attribution::new("engine::rank").with_run(run_id),
    )
    .await;
    let dropped = dropped_count(attempted, ranked.scored, ranked.candidates.len());

    GenerationResponse {
        meta: ResponseMeta {
            run_id,
            model_id: OFFLINE_MODEL_ID.to_string(),
            used_k: ranked.candidates.len(),
            dropped,
            attempted_calls: attempted,
            failed_calls: 0,
            params: RunParams {
                calls: Vec::new(),
                min_return: bounds.min_return,
                max_return: bounds.max_return,
                prefer_count: bounds.prefer_count,
                coverage_target: ranked.coverage_target,
                weights,
            },
        },
        candidates: ranked.candidates,
    }
}
