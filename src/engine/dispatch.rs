//! Concurrent fan-out of planned calls to the generation gateway.
//!
//! Every planned call runs; a failed call never cancels its siblings.
//! Outcomes come back in call-index order regardless of completion order.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use super::plan::{DecodingPlan, PlannedCall};
use super::types::{GenerationRequest, RawGeneration};
use crate::gateway::{Attribution, GenerationCall, GenerationGateway, GenerationOutput, ProviderError};
use crate::tokens::{count_tokens, count_words};

pub const CALLER: &str = "engine::dispatch";

const ESTIMATE_BASE: f64 = 0.9;
const ESTIMATE_PER_WORD: f64 = 0.004;
const ESTIMATE_FLOOR: f64 = -3.0;

/// Result of one planned call.
#[derive(Debug)]
pub struct CallOutcome {
    pub call_index: usize,
    /// Composed backend input.
    pub input: String,
    pub latency_ms: u64,
    pub result: Result<RawGeneration, ProviderError>,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// One per planned call, ordered by call index.
    pub outcomes: Vec<CallOutcome>,
}

impl DispatchOutcome {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn generations(&self) -> Vec<RawGeneration> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().cloned())
            .collect()
    }
}

/// Persona, conversation, instruction and prompt as one input block.
pub fn compose_input(req: &GenerationRequest, instruction: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(persona) = req.system_persona.as_deref().map(str::trim) {
        if !persona.is_empty() {
            parts.push(persona.to_string());
        }
    }

    let context: Vec<&str> = req
        .context
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if !context.is_empty() {
        parts.push(format!("Conversation so far:\n{}", context.join("\n")));
    }

    parts.push(format!("Instruction: {}", instruction.trim()));

    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        parts.push("Assistant:".to_string());
    } else {
        parts.push(format!("User: {prompt}\nAssistant:"));
    }
    parts.join("\n\n")
}

/// Word-count estimate used when no token log-probs come back.
pub fn estimate_avg_log_prob(text: &str) -> f64 {
    (-(ESTIMATE_BASE + ESTIMATE_PER_WORD * count_words(text) as f64)).clamp(ESTIMATE_FLOOR, -ESTIMATE_BASE)
}

fn to_raw_generation(call: &PlannedCall, output: GenerationOutput) -> RawGeneration {
    let avg_log_prob = output
        .mean_logprob()
        .unwrap_or_else(|| estimate_avg_log_prob(&output.text));
    let token_count = output
        .output_tokens
        .map(|n| n as usize)
        .unwrap_or_else(|| count_tokens(&output.text));
    RawGeneration {
        text: output.text,
        token_count,
        avg_log_prob,
        seed: call.seed,
        call_index: call.call_index,
        variant_tag: call.variant_tag,
    }
}

/// Run every planned call concurrently and wait for all of them.
pub async fn dispatch(
    gateway: &dyn GenerationGateway,
    req: &GenerationRequest,
    plan: &DecodingPlan,
    run_id: Uuid,
) -> DispatchOutcome {
    if plan.is_empty() {
        return DispatchOutcome::default();
    }

    let tasks = plan.calls.iter().map(|planned| {
        let input = compose_input(req, &planned.instruction);
        let call = GenerationCall::new(
            input.clone(),
            planned.seed,
            planned.params.clone(),
            Attribution::new(CALLER)
                .with_run(run_id)
                .with_call_index(planned.call_index),
        );
        async move {
            let start = Instant::now();
            let result = gateway.generate(call).await;
            let latency_ms = start.elapsed().as_millis() as u64;
            (planned, input, latency_ms, result)
        }
    });

    let mut outcomes: Vec<CallOutcome> = stream::iter(tasks)
        .buffer_unordered(plan.len())
        .map(|(planned, input, latency_ms, result)| {
            let result = match result {
                Ok(output) => Ok(to_raw_generation(planned, output)),
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        call_index = planned.call_index,
                        seed = planned.seed,
                        code = e.code(),
                        error = %e,
                        "Generation call failed"
                    );
                    Err(e)
                }
            };
            CallOutcome {
                call_index: planned.call_index,
                input,
                latency_ms,
                result,
            }
        })
        .collect()
        .await;

    outcomes.sort_by_key(|o| o.call_index);
    DispatchOutcome { outcomes }
}
