//! Request/response types for the candidate engine.
//!
//! Field names serialize in camelCase: the UI layer consuming
//! `GenerationResponse` reads `tokenCount`, `avgLogProb`, `usedK` and so on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::normalize::strip_role_label;
use crate::gateway::DecodingParams;

// =============================================================================
// Request
// =============================================================================

/// Decoding defaults the plan builder starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecodingDefaults {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_new_tokens: u32,
    pub stop: Vec<String>,
}

impl Default for DecodingDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            max_new_tokens: 120,
            stop: Vec::new(),
        }
    }
}

/// One engine invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// The triggering user utterance.
    pub prompt: String,
    /// Prior conversation lines, oldest first, already window-trimmed.
    #[serde(default)]
    pub context: Vec<String>,
    /// Free-text behavioral guidance.
    #[serde(default)]
    pub system_persona: Option<String>,
    /// Desired number of generation calls (1..=8).
    #[serde(default)]
    pub call_count: Option<usize>,
    /// Explicit per-call instructions; overrides `call_count`.
    #[serde(default)]
    pub per_call_instructions: Option<Vec<String>>,
    #[serde(default)]
    pub decoding: Option<DecodingDefaults>,
    #[serde(default)]
    pub min_return: Option<usize>,
    #[serde(default)]
    pub max_return: Option<usize>,
    #[serde(default)]
    pub prefer_count: Option<usize>,
    /// Fixed coverage target in (0, 1]; adaptive when absent.
    #[serde(default)]
    pub coverage_target: Option<f64>,
    /// Makes seeds, instruction order and jitter reproducible.
    #[serde(default)]
    pub sampling_seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn context(mut self, lines: Vec<String>) -> Self {
        self.context = lines;
        self
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.system_persona = Some(persona.into());
        self
    }

    pub fn call_count(mut self, n: usize) -> Self {
        self.call_count = Some(n);
        self
    }

    pub fn instructions(mut self, instructions: Vec<String>) -> Self {
        self.per_call_instructions = Some(instructions);
        self
    }

    pub fn decoding(mut self, decoding: DecodingDefaults) -> Self {
        self.decoding = Some(decoding);
        self
    }

    pub fn shortlist(mut self, min_return: usize, max_return: usize, prefer_count: usize) -> Self {
        self.min_return = Some(min_return);
        self.max_return = Some(max_return);
        self.prefer_count = Some(prefer_count);
        self
    }

    pub fn coverage(mut self, target: f64) -> Self {
        self.coverage_target = Some(target);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling_seed = Some(seed);
        self
    }

    /// The utterance candidates are scored against: the prompt, or the newest
    /// non-empty context line without its speaker label when the prompt is
    /// blank.
    pub fn last_user_utterance(&self) -> &str {
        last_user_utterance(&self.prompt, &self.context)
    }
}

pub(crate) fn last_user_utterance<'a>(prompt: &'a str, context: &'a [String]) -> &'a str {
    if !prompt.trim().is_empty() {
        return prompt;
    }
    context
        .iter()
        .rev()
        .map(|l| strip_role_label(l))
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

// =============================================================================
// Intermediate
// =============================================================================

/// Whether a call was the conservative anchor or an exploratory one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantTag {
    Primary,
    Alt,
}

impl VariantTag {
    pub fn for_index(call_index: usize) -> Self {
        if call_index == 0 {
            VariantTag::Primary
        } else {
            VariantTag::Alt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantTag::Primary => "primary",
            VariantTag::Alt => "alt",
        }
    }
}

/// One successful generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGeneration {
    pub text: String,
    pub token_count: usize,
    pub avg_log_prob: f64,
    pub seed: u32,
    pub call_index: usize,
    pub variant_tag: VariantTag,
}

/// Utility weights and softmax temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowWeights {
    /// Weight on mean log-probability.
    pub a: f64,
    /// Weight on similarity to the last user utterance.
    pub b: f64,
    /// Weight on total penalty.
    pub g: f64,
    /// Softmax temperature.
    pub tau: f64,
}

impl Default for FlowWeights {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.8,
            g: 0.2,
            tau: 0.9,
        }
    }
}

/// Per-candidate scoring signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSignals {
    pub sim_to_last_user: f64,
    pub length_penalty: f64,
    pub repetition_penalty: f64,
    pub total_penalty: f64,
    pub utility: f64,
    /// Softmax probability over the whole scored batch.
    pub prob: f64,
}

// =============================================================================
// Response
// =============================================================================

/// A ranked reply suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub text: String,
    pub token_count: usize,
    pub avg_log_prob: f64,
    /// Same as `flow.prob`; not renormalized after selection.
    pub probability: f64,
    pub seed: u32,
    pub variant_tag: VariantTag,
    pub flow: FlowSignals,
    pub weights: FlowWeights,
}

/// Decoding settings actually used for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_index: usize,
    pub seed: u32,
    pub variant_tag: VariantTag,
    pub instruction: String,
    pub decoding: DecodingParams,
}

/// Parameters the run resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub calls: Vec<CallSummary>,
    pub min_return: usize,
    pub max_return: usize,
    pub prefer_count: usize,
    /// Coverage target used by the slice (caller-supplied or adaptive).
    pub coverage_target: Option<f64>,
    pub weights: FlowWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub run_id: Uuid,
    pub model_id: String,
    pub used_k: usize,
    /// (attempted − cleaned) + (scored − selected).
    pub dropped: usize,
    pub attempted_calls: usize,
    pub failed_calls: usize,
    pub params: RunParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub candidates: Vec<Candidate>,
    pub meta: ResponseMeta,
}

// =============================================================================
// Offline ranking
// =============================================================================

/// A text produced elsewhere, ranked without calling any backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineGeneration {
    pub text: String,
    #[serde(default)]
    pub avg_log_prob: Option<f64>,
    #[serde(default)]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub seed: Option<u32>,
}

impl OfflineGeneration {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn log_prob(mut self, avg_log_prob: f64) -> Self {
        self.avg_log_prob = Some(avg_log_prob);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<String>,
    pub generations: Vec<OfflineGeneration>,
    #[serde(default)]
    pub min_return: Option<usize>,
    #[serde(default)]
    pub max_return: Option<usize>,
    #[serde(default)]
    pub prefer_count: Option<usize>,
    #[serde(default)]
    pub coverage_target: Option<f64>,
}
