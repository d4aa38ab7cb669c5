//! Core types for the generation gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every call through the gateway carries attribution so we know:
/// - Which engine run it belongs to (run_id)
/// - Which call of the run it was (call_index)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Engine run this call is part of.
    pub run_id: Option<Uuid>,
    /// Position of the call inside its decoding plan.
    pub call_index: Option<usize>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "engine::dispatch".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_call_index(mut self, index: usize) -> Self {
        self.call_index = Some(index);
        self
    }
}

// =============================================================================
// MODEL
// =============================================================================

/// Backend model reference: the model id plus the project it is billed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub model_id: String,
    pub project_id: String,
}

impl ModelRef {
    pub fn new(model_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn provider(&self) -> &'static str {
        "watsonx"
    }
}

// =============================================================================
// GENERATION TYPES
// =============================================================================

/// Sampling controls for a single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_new_tokens: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// One request to the text-generation backend.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    /// Fully composed input text (persona, context, instruction, prompt).
    pub input: String,
    /// Sampling seed forwarded to the backend.
    pub seed: u32,
    pub params: DecodingParams,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl GenerationCall {
    pub fn new(
        input: impl Into<String>,
        seed: u32,
        params: DecodingParams,
        attribution: Attribution,
    ) -> Self {
        Self {
            input: input.into(),
            seed,
            params,
            attribution,
        }
    }
}

/// Reason the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    StopSequence,
    MaxTokens,
    Unknown(String),
}

impl From<Option<String>> for StopReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("eos_token") => StopReason::EndOfSequence,
            Some("stop_sequence") => StopReason::StopSequence,
            Some("max_tokens") => StopReason::MaxTokens,
            Some(other) => StopReason::Unknown(other.to_string()),
            None => StopReason::Unknown("none".to_string()),
        }
    }
}

/// A single generated token with its log-probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
}

/// Output of a successful generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Generated text, exactly as the backend returned it.
    pub text: String,
    /// Tokens generated, if the backend reported it.
    pub output_tokens: Option<u32>,
    /// Tokens consumed by the input, if reported.
    pub input_tokens: Option<u32>,
    /// Per-token log-probabilities, if the backend returned them.
    pub token_logprobs: Option<Vec<TokenLogprob>>,
    pub stop_reason: StopReason,
    /// Time taken for the call.
    pub latency: Duration,
    /// Backend request id (for debugging).
    pub request_id: Option<String>,
}

impl GenerationOutput {
    /// Mean of the finite per-token log-probabilities, if any were returned.
    pub fn mean_logprob(&self) -> Option<f64> {
        let lps = self.token_logprobs.as_ref()?;
        let finite: Vec<f64> = lps
            .iter()
            .map(|t| t.logprob)
            .filter(|lp| lp.is_finite())
            .collect();
        if finite.is_empty() {
            return None;
        }
        Some(finite.iter().sum::<f64>() / finite.len() as f64)
    }
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Request to embed texts.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Texts to embed. Each text produces one embedding vector.
    pub texts: Vec<String>,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(texts: Vec<String>, attribution: Attribution) -> Self {
        Self { texts, attribution }
    }
}

/// Response from an embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// Embedding vectors, one per input text.
    pub embeddings: Vec<Vec<f32>>,
    /// Total input tokens consumed.
    pub tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
}
