//! Flow scoring: similarity to the last user utterance, length and
//! repetition penalties, blended utility, and a softmax over the batch.

use std::collections::HashSet;

use super::similarity::{word_tokens, Similarity};
use super::types::{Candidate, FlowSignals, FlowWeights, RawGeneration};
use crate::gateway::Attribution;

/// Characters allowed before the length penalty starts growing.
pub const SOFT_LENGTH_BUDGET: usize = 400;
/// Shorter texts get no repetition penalty.
pub const MIN_WORDS_FOR_REPETITION: usize = 6;
/// Stand-in for a non-finite mean log-probability.
const LOG_PROB_FLOOR: f64 = -10.0;
const MIN_TAU: f64 = 1e-6;

/// A cleaned generation with its flow signals.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub generation: RawGeneration,
    pub flow: FlowSignals,
}

impl ScoredCandidate {
    pub fn text(&self) -> &str {
        &self.generation.text
    }

    pub fn utility(&self) -> f64 {
        self.flow.utility
    }

    pub fn prob(&self) -> f64 {
        self.flow.prob
    }

    pub fn into_candidate(self, weights: FlowWeights) -> Candidate {
        Candidate {
            text: self.generation.text,
            token_count: self.generation.token_count,
            avg_log_prob: self.generation.avg_log_prob,
            probability: self.flow.prob,
            seed: self.generation.seed,
            variant_tag: self.generation.variant_tag,
            flow: self.flow,
            weights,
        }
    }
}

/// Linear growth past the soft budget: `(chars - 400) / 400`.
pub fn length_penalty(text: &str) -> f64 {
    let chars = text.chars().count();
    if chars <= SOFT_LENGTH_BUDGET {
        return 0.0;
    }
    (chars - SOFT_LENGTH_BUDGET) as f64 / SOFT_LENGTH_BUDGET as f64
}

/// Fraction of word bigrams that repeat an earlier bigram.
pub fn repetition_penalty(text: &str) -> f64 {
    let words = word_tokens(text);
    if words.len() < MIN_WORDS_FOR_REPETITION {
        return 0.0;
    }
    let bigrams: Vec<(&str, &str)> = words
        .windows(2)
        .map(|w| (w[0].as_str(), w[1].as_str()))
        .collect();
    let unique: HashSet<&(&str, &str)> = bigrams.iter().collect();
    (bigrams.len() - unique.len()) as f64 / bigrams.len() as f64
}

/// Numerically stable softmax at temperature `tau`.
pub fn softmax(values: &[f64], tau: f64) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let tau = if tau.is_finite() { tau.max(MIN_TAU) } else { 1.0 };
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| ((v - max) / tau).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Score with precomputed similarities (one per generation, same order).
pub fn score_with_similarities(
    generations: Vec<RawGeneration>,
    similarities: &[f64],
    weights: &FlowWeights,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = generations
        .into_iter()
        .enumerate()
        .map(|(i, generation)| {
            let sim = similarities
                .get(i)
                .copied()
                .filter(|s| s.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            let length = length_penalty(&generation.text);
            let repetition = repetition_penalty(&generation.text);
            let total = length + repetition;
            let log_prob = if generation.avg_log_prob.is_finite() {
                generation.avg_log_prob
            } else {
                LOG_PROB_FLOOR
            };
            let utility = weights.a * log_prob + weights.b * sim - weights.g * total;
            ScoredCandidate {
                generation,
                flow: FlowSignals {
                    sim_to_last_user: sim,
                    length_penalty: length,
                    repetition_penalty: repetition,
                    total_penalty: total,
                    utility,
                    prob: 0.0,
                },
            }
        })
        .collect();

    let utilities: Vec<f64> = scored.iter().map(|c| c.flow.utility).collect();
    for (candidate, prob) in scored.iter_mut().zip(softmax(&utilities, weights.tau)) {
        candidate.flow.prob = prob;
    }
    scored
}

/// Score the whole cleaned batch against `last_user`.
pub async fn score_candidates(
    generations: Vec<RawGeneration>,
    last_user: &str,
    similarity: &Similarity,
    weights: &FlowWeights,
    attribution: Attribution,
) -> Vec<ScoredCandidate> {
    if generations.is_empty() {
        return Vec::new();
    }
    let texts: Vec<String> = generations.iter().map(|g| g.text.clone()).collect();
    let similarities = similarity
        .to_reference(last_user, &texts, attribution)
        .await;
    score_with_similarities(generations, &similarities, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::VariantTag;

    fn generation(text: &str, avg_log_prob: f64) -> RawGeneration {
        RawGeneration {
            text: text.to_string(),
            token_count: 4,
            avg_log_prob,
            seed: 1,
            call_index: 0,
            variant_tag: VariantTag::Primary,
        }
    }

    #[test]
    fn length_penalty_starts_past_budget() {
        assert_eq!(length_penalty(&"a".repeat(400)), 0.0);
        assert!((length_penalty(&"a".repeat(600)) - 0.5).abs() < 1e-12);
        assert!((length_penalty(&"é".repeat(800)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn repetition_penalty_needs_six_words() {
        assert_eq!(repetition_penalty("go go go go go"), 0.0);
        // bigrams: (go,go) x5 -> 4 repeats of 5
        assert!((repetition_penalty("go go go go go go") - 0.8).abs() < 1e-12);
        assert_eq!(repetition_penalty("one two three four five six"), 0.0);
    }

    #[test]
    fn softmax_sums_to_one_and_is_stable() {
        let probs = softmax(&[1000.0, 1001.0, 999.0], 0.9);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!(probs[1] > probs[0] && probs[0] > probs[2]);
        assert!(softmax(&[], 0.9).is_empty());
    }

    #[test]
    fn lower_tau_sharpens() {
        let sharp = softmax(&[0.0, 1.0], 0.1);
        let flat = softmax(&[0.0, 1.0], 10.0);
        assert!(sharp[1] > flat[1]);
    }

    #[test]
    fn utility_blends_signals() {
        let weights = FlowWeights::default();
        let scored = score_with_similarities(
            vec![generation("sure thing", -1.0), generation("nope", -2.0)],
            &[0.5, 0.0],
            &weights,
        );
        assert!((scored[0].flow.utility - (-1.0 + 0.8 * 0.5)).abs() < 1e-12);
        assert!((scored[1].flow.utility - (-2.0)).abs() < 1e-12);
        let total: f64 = scored.iter().map(|c| c.flow.prob).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(scored[0].flow.prob > scored[1].flow.prob);
    }

    #[test]
    fn penalties_reduce_utility() {
        let long = "word ".repeat(120);
        let scored = score_with_similarities(
            vec![generation(&long, -1.0)],
            &[0.0],
            &FlowWeights::default(),
        );
        let flow = scored[0].flow;
        assert!(flow.length_penalty > 0.0);
        assert!(flow.repetition_penalty > 0.9);
        assert!((flow.total_penalty - (flow.length_penalty + flow.repetition_penalty)).abs() < 1e-12);
        assert!(flow.utility < -1.0);
    }

    #[tokio::test]
    async fn lexical_scoring_uses_last_user_line() {
        let scored = score_candidates(
            vec![generation("pizza sounds great", -1.0), generation("maybe later", -1.0)],
            "want pizza?",
            &Similarity::Lexical,
            &FlowWeights::default(),
            Attribution::new("test"),
        )
        .await;
        assert!(scored[0].flow.sim_to_last_user > 0.0);
        assert_eq!(scored[1].flow.sim_to_last_user, 0.0);
        assert!(scored[0].utility() > scored[1].utility());
    }
}
