//! Decoding plan: how many calls, which instruction each one carries, and the
//! sampling parameters and seed it runs with.
//!
//! Call 0 is the conservative anchor. Later calls widen temperature, nucleus
//! mass and top-k with their index, and each alt call gets a small bounded
//! temperature jitter. All randomness (seed base, instruction shuffle, jitter)
//! flows from one `StdRng` seeded with the request's base seed, so a fixed
//! `samplingSeed` reproduces the whole plan.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::types::{CallSummary, DecodingDefaults, GenerationRequest, VariantTag};
use crate::gateway::watsonx::MAX_STOP_SEQUENCES;
use crate::gateway::DecodingParams;

pub const MAX_CALLS: usize = 8;
pub const DEFAULT_CALL_COUNT: usize = 6;

pub const DEFAULT_INSTRUCTIONS: [&str; 7] = [
    "Be concise and offer one concrete suggestion.",
    "Ask a brief clarifying question.",
    "Politely decline and propose an alternative.",
    "Respond warmly and show genuine interest.",
    "Agree and add one relevant detail.",
    "Answer directly in a single sentence.",
    "Share a short personal opinion and invite theirs.",
];

pub const DEFAULT_STOP_SEQUENCES: [&str; 6] = [
    "\n\n",
    "User:",
    "Assistant:",
    "###",
    "<|endoftext|>",
    "[END]",
];

const PRIMARY_MAX_TEMPERATURE: f64 = 0.25;
const PRIMARY_MAX_TOP_P: f64 = 0.8;
const PRIMARY_MAX_TOP_K: u32 = 20;
const MAX_TEMPERATURE: f64 = 2.0;
const TEMPERATURE_JITTER: f64 = 0.08;
const TOP_P_WIDENING: f64 = 0.05;
const TOP_K_WIDENING: u32 = 20;
/// Largest top-k the generation endpoint accepts.
pub const MAX_TOP_K: u32 = 100;

/// Supplies the base seed when the request does not pin one.
pub trait RandomSource: Send + Sync {
    fn base_seed(&self) -> u64;
}

/// Fresh, unpredictable base per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntropySource;

impl RandomSource for EntropySource {
    fn base_seed(&self) -> u64 {
        rand::random::<u64>()
    }
}

/// Always returns the same base.
#[derive(Debug, Clone, Copy)]
pub struct FixedSeed(pub u64);

impl RandomSource for FixedSeed {
    fn base_seed(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    pub call_index: usize,
    pub instruction: String,
    pub seed: u32,
    pub variant_tag: VariantTag,
    pub params: DecodingParams,
}

impl PlannedCall {
    pub fn summary(&self) -> CallSummary {
        CallSummary {
            call_index: self.call_index,
            seed: self.seed,
            variant_tag: self.variant_tag,
            instruction: self.instruction.clone(),
            decoding: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodingPlan {
    pub base_seed: u64,
    pub stop_sequences: Vec<String>,
    pub calls: Vec<PlannedCall>,
}

impl DecodingPlan {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Build the plan for one request. Pure computation; cannot fail.
pub fn build_plan(req: &GenerationRequest, random: &dyn RandomSource) -> DecodingPlan {
    let base_seed = req.sampling_seed.unwrap_or_else(|| random.base_seed());
    let mut rng = StdRng::seed_from_u64(base_seed);

    let instructions = resolve_instructions(req, &mut rng);
    let k = instructions.len();
    let defaults = sanitize(req.decoding.clone().unwrap_or_default());
    let stop_sequences = merge_stop_sequences(&defaults.stop);

    let calls = instructions
        .into_iter()
        .enumerate()
        .map(|(i, instruction)| PlannedCall {
            call_index: i,
            instruction,
            seed: derive_seed(base_seed, i),
            variant_tag: VariantTag::for_index(i),
            params: call_params(&defaults, i, k, &stop_sequences, &mut rng),
        })
        .collect();

    DecodingPlan {
        base_seed,
        stop_sequences,
        calls,
    }
}

/// `(base + i) mod 2^32`.
pub fn derive_seed(base: u64, index: usize) -> u32 {
    (base.wrapping_add(index as u64) & 0xFFFF_FFFF) as u32
}

/// Caller stops first, then defaults; blanks dropped, duplicates removed,
/// capped at the backend maximum.
pub fn merge_stop_sequences(caller: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(MAX_STOP_SEQUENCES);
    let candidates = caller
        .iter()
        .map(String::as_str)
        .chain(DEFAULT_STOP_SEQUENCES.iter().copied());
    for stop in candidates {
        if stop.is_empty() || merged.iter().any(|s| s == stop) {
            continue;
        }
        merged.push(stop.to_string());
        if merged.len() == MAX_STOP_SEQUENCES {
            break;
        }
    }
    merged
}

fn resolve_instructions(req: &GenerationRequest, rng: &mut StdRng) -> Vec<String> {
    let explicit: Vec<String> = req
        .per_call_instructions
        .iter()
        .flatten()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .take(MAX_CALLS)
        .map(str::to_string)
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }

    let k = req
        .call_count
        .unwrap_or(DEFAULT_CALL_COUNT)
        .clamp(1, MAX_CALLS);
    let mut pool = DEFAULT_INSTRUCTIONS;
    pool.shuffle(rng);
    (0..k).map(|i| pool[i % pool.len()].to_string()).collect()
}

fn sanitize(mut d: DecodingDefaults) -> DecodingDefaults {
    let fallback = DecodingDefaults::default();
    if !d.temperature.is_finite() || d.temperature < 0.0 {
        d.temperature = fallback.temperature;
    }
    d.temperature = d.temperature.min(MAX_TEMPERATURE);
    if !d.top_p.is_finite() || d.top_p <= 0.0 {
        d.top_p = fallback.top_p;
    }
    d.top_p = d.top_p.min(1.0);
    d.top_k = d.top_k.clamp(1, MAX_TOP_K);
    d.max_new_tokens = d.max_new_tokens.max(1);
    d
}

/// Temperature for call `i` of `k` before jitter. Never below call 0's.
fn scheduled_temperature(d: &DecodingDefaults, i: usize, k: usize) -> f64 {
    let t0 = d.temperature.min(PRIMARY_MAX_TEMPERATURE);
    if i == 0 {
        return t0;
    }
    (d.temperature * (0.75 + 0.5 * fraction(i, k))).clamp(t0, MAX_TEMPERATURE)
}

fn fraction(i: usize, k: usize) -> f64 {
    if k <= 1 {
        0.0
    } else {
        i as f64 / (k - 1) as f64
    }
}

fn call_params(
    d: &DecodingDefaults,
    i: usize,
    k: usize,
    stop: &[String],
    rng: &mut StdRng,
) -> DecodingParams {
    let t0 = d.temperature.min(PRIMARY_MAX_TEMPERATURE);
    let p0 = d.top_p.min(PRIMARY_MAX_TOP_P);
    let k0 = d.top_k.min(PRIMARY_MAX_TOP_K);

    let (temperature, top_p, top_k) = if i == 0 {
        (t0, p0, k0)
    } else {
        let frac = fraction(i, k);
        let jitter = 1.0 + rng.gen_range(-TEMPERATURE_JITTER..=TEMPERATURE_JITTER);
        let temperature =
            (scheduled_temperature(d, i, k) * jitter).clamp(t0, MAX_TEMPERATURE);

        let p_max = (d.top_p + TOP_P_WIDENING).min(1.0);
        let top_p = p0 + (p_max - p0) * frac;

        let k_max = d.top_k.max(k0).saturating_add(TOP_K_WIDENING).min(MAX_TOP_K);
        let top_k = k0 + (k_max.saturating_sub(k0) as f64 * frac).round() as u32;
        (temperature, top_p, top_k)
    };

    DecodingParams {
        temperature,
        top_p,
        top_k,
        max_new_tokens: d.max_new_tokens,
        stop: stop.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(k: usize) -> GenerationRequest {
        GenerationRequest::new("hey").call_count(k)
    }

    #[test]
    fn call_zero_is_conservative() {
        let req = request(6).decoding(DecodingDefaults {
            temperature: 1.2,
            top_p: 0.95,
            top_k: 80,
            ..Default::default()
        });
        let plan = build_plan(&req, &FixedSeed(11));
        let first = &plan.calls[0];
        assert_eq!(first.variant_tag, VariantTag::Primary);
        assert!(first.params.temperature <= 0.25);
        assert!(first.params.top_p <= 0.8);
        assert!(first.params.top_k <= 20);
        for call in &plan.calls[1..] {
            assert_eq!(call.variant_tag, VariantTag::Alt);
            assert!(call.params.temperature >= first.params.temperature);
            assert!(call.params.top_p >= first.params.top_p);
            assert!(call.params.top_k >= first.params.top_k);
        }
    }

    #[test]
    fn schedule_widens_monotonically_before_jitter() {
        let d = DecodingDefaults::default();
        let temps: Vec<f64> = (0..8).map(|i| scheduled_temperature(&d, i, 8)).collect();
        assert!(temps.windows(2).all(|w| w[0] <= w[1]), "{temps:?}");

        let plan = build_plan(&request(8), &FixedSeed(3));
        let top_ks: Vec<u32> = plan.calls.iter().map(|c| c.params.top_k).collect();
        let top_ps: Vec<f64> = plan.calls.iter().map(|c| c.params.top_p).collect();
        assert!(top_ks.windows(2).all(|w| w[0] <= w[1]), "{top_ks:?}");
        assert!(top_ps.windows(2).all(|w| w[0] <= w[1]), "{top_ps:?}");
        assert_eq!(*top_ks.last().unwrap(), 70);
        assert!((top_ps.last().unwrap() - 0.95).abs() < 1e-12);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let d = DecodingDefaults::default();
        for seed in 0..50u64 {
            let plan = build_plan(&request(5), &FixedSeed(seed));
            for call in &plan.calls[1..] {
                let scheduled = scheduled_temperature(&d, call.call_index, 5);
                let ratio = call.params.temperature / scheduled;
                assert!((0.92 - 1e-9..=1.08 + 1e-9).contains(&ratio), "{ratio}");
            }
        }
    }

    #[test]
    fn fixed_seed_reproduces_the_plan() {
        let req = request(6).seed(424242);
        let a = build_plan(&req, &EntropySource);
        let b = build_plan(&req, &EntropySource);
        assert_eq!(a, b);
        assert_eq!(a.base_seed, 424242);
    }

    #[test]
    fn random_source_is_used_without_request_seed() {
        let a = build_plan(&request(3), &FixedSeed(99));
        assert_eq!(a.base_seed, 99);
        let seeds: Vec<u32> = a.calls.iter().map(|c| c.seed).collect();
        assert_eq!(seeds, vec![99, 100, 101]);
    }

    #[test]
    fn seeds_wrap_modulo_u32() {
        assert_eq!(derive_seed(u32::MAX as u64, 0), u32::MAX);
        assert_eq!(derive_seed(u32::MAX as u64, 1), 0);
        assert_eq!(derive_seed((1u64 << 32) + 5, 2), 7);
    }

    #[test]
    fn call_count_is_clamped() {
        assert_eq!(build_plan(&request(0), &FixedSeed(1)).len(), 1);
        assert_eq!(build_plan(&request(20), &FixedSeed(1)).len(), MAX_CALLS);
        let default = build_plan(&GenerationRequest::new("x"), &FixedSeed(1));
        assert_eq!(default.len(), DEFAULT_CALL_COUNT);
    }

    #[test]
    fn default_pool_is_distinct_until_it_cycles() {
        let plan = build_plan(&request(7), &FixedSeed(5));
        let mut seen: Vec<&str> = plan.calls.iter().map(|c| c.instruction.as_str()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);

        let plan = build_plan(&request(8), &FixedSeed(5));
        assert_eq!(plan.calls[7].instruction, plan.calls[0].instruction);
    }

    #[test]
    fn shuffle_varies_with_seed() {
        let orders: Vec<Vec<String>> = (0..10u64)
            .map(|s| {
                build_plan(&request(6), &FixedSeed(s))
                    .calls
                    .into_iter()
                    .map(|c| c.instruction)
                    .collect()
            })
            .collect();
        assert!(orders.iter().any(|o| o != &orders[0]));
    }

    #[test]
    fn explicit_instructions_override_count_and_are_capped() {
        let instructions: Vec<String> = (0..12).map(|i| format!("do {i}")).collect();
        let req = request(2).instructions(instructions);
        let plan = build_plan(&req, &FixedSeed(1));
        assert_eq!(plan.len(), MAX_CALLS);
        assert_eq!(plan.calls[0].instruction, "do 0");
        assert_eq!(plan.calls[7].instruction, "do 7");
    }

    #[test]
    fn blank_explicit_instructions_fall_back_to_pool() {
        let req = request(3).instructions(vec!["  ".into(), String::new()]);
        let plan = build_plan(&req, &FixedSeed(1));
        assert_eq!(plan.len(), 3);
        assert!(DEFAULT_INSTRUCTIONS.contains(&plan.calls[0].instruction.as_str()));
    }

    #[test]
    fn stop_sequences_merge_dedupe_and_truncate() {
        let caller = vec![
            "Bye".to_string(),
            "User:".to_string(),
            String::new(),
            "Bye".to_string(),
        ];
        let merged = merge_stop_sequences(&caller);
        assert_eq!(merged.len(), MAX_STOP_SEQUENCES);
        assert_eq!(merged[0], "Bye");
        assert_eq!(merged[1], "User:");
        assert_eq!(merged[2], "\n\n");
        assert!(!merged.iter().any(|s| s.is_empty()));

        let defaults_only = merge_stop_sequences(&[]);
        assert_eq!(defaults_only, DEFAULT_STOP_SEQUENCES.map(String::from).to_vec());
    }

    #[test]
    fn bad_defaults_are_sanitized() {
        let req = request(2).decoding(DecodingDefaults {
            temperature: f64::NAN,
            top_p: 0.0,
            top_k: 0,
            max_new_tokens: 0,
            stop: vec![],
        });
        let plan = build_plan(&req, &FixedSeed(1));
        let first = &plan.calls[0].params;
        assert!(first.temperature.is_finite());
        assert!(first.top_p > 0.0);
        assert!(first.top_k >= 1);
        assert!(first.max_new_tokens >= 1);
    }

    #[test]
    fn oversized_top_k_is_capped() {
        let req = request(3).decoding(DecodingDefaults {
            top_k: u32::MAX,
            ..DecodingDefaults::default()
        });
        let plan = build_plan(&req, &FixedSeed(9));
        let top_ks: Vec<u32> = plan.calls.iter().map(|c| c.params.top_k).collect();
        assert_eq!(top_ks[0], 20);
        assert_eq!(top_ks[2], MAX_TOP_K);
        assert!(top_ks.windows(2).all(|w| w[0] <= w[1]));
    }
}
