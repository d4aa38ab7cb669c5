//! Diversity selection: MMR reorder, near-duplicate filter, coverage slice
//! and preferred-count trim.
//!
//! Probabilities are carried through unchanged. They were computed over the
//! full scored batch and are never renormalized over the shortlist.

use std::collections::HashSet;

use super::score::ScoredCandidate;
use super::similarity::{jaccard_sets, token_set, word_tokens};
use super::types::GenerationRequest;

pub const MMR_LAMBDA: f64 = 0.15;
/// Texts shorter than this (in chars) use the short duplicate threshold.
pub const SHORT_TEXT_CHARS: usize = 45;
pub const SHORT_DUPLICATE_THRESHOLD: f64 = 0.97;
pub const DUPLICATE_THRESHOLD: f64 = 0.88;
pub const FOURTH_ITEM_FLOOR: f64 = 0.04;
pub const TRIM_TOLERANCE: f64 = 0.01;

pub const SHORTLIST_FLOOR: usize = 3;
pub const SHORTLIST_CEILING: usize = 6;
pub const DEFAULT_PREFER_COUNT: usize = 5;

const COVERAGE_BASE: f64 = 0.84;
const COVERAGE_ENTROPY_WEIGHT: f64 = 0.08;
const COVERAGE_MIN: f64 = 0.82;
const COVERAGE_MAX: f64 = 0.94;

/// Shortlist size controls after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionBounds {
    pub min_return: usize,
    pub max_return: usize,
    pub prefer_count: usize,
    pub coverage_target: Option<f64>,
}

impl Default for SelectionBounds {
    fn default() -> Self {
        Self {
            min_return: SHORTLIST_FLOOR,
            max_return: SHORTLIST_CEILING,
            prefer_count: DEFAULT_PREFER_COUNT,
            coverage_target: None,
        }
    }
}

impl SelectionBounds {
    /// Clamp min/max into [3, 6], prefer into [min, max]. A non-positive or
    /// non-finite coverage target falls back to the adaptive one; larger
    /// than 1 is capped at 1.
    pub fn new(
        min_return: Option<usize>,
        max_return: Option<usize>,
        prefer_count: Option<usize>,
        coverage_target: Option<f64>,
    ) -> Self {
        let min_return = min_return
            .unwrap_or(SHORTLIST_FLOOR)
            .clamp(SHORTLIST_FLOOR, SHORTLIST_CEILING);
        let max_return = max_return
            .unwrap_or(SHORTLIST_CEILING)
            .clamp(SHORTLIST_FLOOR, SHORTLIST_CEILING)
            .max(min_return);
        let prefer_count = prefer_count
            .unwrap_or(DEFAULT_PREFER_COUNT)
            .clamp(min_return, max_return);
        let coverage_target = coverage_target
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| t.min(1.0));
        Self {
            min_return,
            max_return,
            prefer_count,
            coverage_target,
        }
    }

    pub fn from_request(req: &GenerationRequest) -> Self {
        Self::new(
            req.min_return,
            req.max_return,
            req.prefer_count,
            req.coverage_target,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Final shortlist, utility descending.
    pub candidates: Vec<ScoredCandidate>,
    /// Coverage target the slice ran with; `None` when nothing was scored.
    pub coverage_target: Option<f64>,
}

/// Run the full selection over a scored batch.
pub fn select(scored: Vec<ScoredCandidate>, bounds: &SelectionBounds) -> Selection {
    if scored.is_empty() {
        return Selection {
            candidates: Vec::new(),
            coverage_target: None,
        };
    }

    let ordered = mmr_order(scored, MMR_LAMBDA);
    let filtered = filter_near_duplicates(ordered, bounds.min_return);
    let (mut shortlist, coverage) = coverage_slice(filtered, bounds);
    trim_to_preferred(&mut shortlist, bounds, coverage);

    shortlist.sort_by(|a, b| b.utility().total_cmp(&a.utility()));
    Selection {
        candidates: shortlist,
        coverage_target: Some(coverage),
    }
}

/// Greedy maximal-marginal-relevance order seeded with the best utility.
pub fn mmr_order(mut scored: Vec<ScoredCandidate>, lambda: f64) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| {
        b.utility()
            .total_cmp(&a.utility())
            .then(a.generation.call_index.cmp(&b.generation.call_index))
    });
    let sets: Vec<HashSet<String>> = scored.iter().map(|c| token_set(c.text())).collect();

    let mut picked: Vec<usize> = Vec::with_capacity(scored.len());
    let mut remaining: Vec<usize> = (0..scored.len()).collect();
    if !remaining.is_empty() {
        picked.push(remaining.remove(0));
    }
    while !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let redundancy = picked
                .iter()
                .map(|&p| jaccard_sets(&sets[idx], &sets[p]))
                .fold(0.0, f64::max);
            let score = scored[idx].utility() - lambda * redundancy;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        picked.push(remaining.remove(best_pos));
    }

    let mut slots: Vec<Option<ScoredCandidate>> = scored.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Jaccard threshold at or above which a text counts as a duplicate.
pub fn duplicate_threshold(text: &str) -> f64 {
    if text.chars().count() < SHORT_TEXT_CHARS {
        SHORT_DUPLICATE_THRESHOLD
    } else {
        DUPLICATE_THRESHOLD
    }
}

/// Threshold for a pair: the stricter of the two texts' own thresholds, so
/// the verdict does not depend on which one was kept first.
pub fn pair_threshold(a: &str, b: &str) -> f64 {
    duplicate_threshold(a).min(duplicate_threshold(b))
}

fn opening_key(text: &str) -> String {
    word_tokens(text)
        .into_iter()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep a candidate only if its opening two words are new and it is not a
/// near-copy of anything already kept. Falls back to the unfiltered order
/// when fewer than `min_return` would survive.
pub fn filter_near_duplicates(
    ordered: Vec<ScoredCandidate>,
    min_return: usize,
) -> Vec<ScoredCandidate> {
    let sets: Vec<HashSet<String>> = ordered.iter().map(|c| token_set(c.text())).collect();
    let mut keys: HashSet<String> = HashSet::new();
    let mut kept: Vec<usize> = Vec::new();

    for (i, candidate) in ordered.iter().enumerate() {
        let key = opening_key(candidate.text());
        if !key.is_empty() && keys.contains(&key) {
            continue;
        }
        if kept.iter().any(|&k| {
            let threshold = pair_threshold(candidate.text(), ordered[k].text());
            jaccard_sets(&sets[i], &sets[k]) >= threshold
        }) {
            continue;
        }
        keys.insert(key);
        kept.push(i);
    }

    if kept.len() < min_return {
        tracing::debug!(
            kept = kept.len(),
            min_return,
            "Duplicate filter too aggressive; keeping unfiltered order"
        );
        return ordered;
    }
    let mut slots: Vec<Option<ScoredCandidate>> = ordered.into_iter().map(Some).collect();
    kept.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// `clamp(0.84 + 0.08 * H_norm, 0.82, 0.94)` over the given probabilities,
/// renormalized for the entropy computation only.
pub fn adaptive_coverage(probs: &[f64]) -> f64 {
    let h = normalized_entropy(probs);
    (COVERAGE_BASE + COVERAGE_ENTROPY_WEIGHT * h).clamp(COVERAGE_MIN, COVERAGE_MAX)
}

/// Shannon entropy divided by `ln(n)`; 0 for fewer than two items.
pub fn normalized_entropy(probs: &[f64]) -> f64 {
    let positive: Vec<f64> = probs
        .iter()
        .copied()
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect();
    if probs.len() < 2 || positive.is_empty() {
        return 0.0;
    }
    let sum: f64 = positive.iter().sum();
    let h: f64 = positive
        .iter()
        .map(|p| {
            let q = p / sum;
            -q * q.ln()
        })
        .sum();
    (h / (probs.len() as f64).ln()).clamp(0.0, 1.0)
}

/// Take candidates by probability until both `min_return` and the coverage
/// mass are reached, capped at `max_return`.
pub fn coverage_slice(
    mut filtered: Vec<ScoredCandidate>,
    bounds: &SelectionBounds,
) -> (Vec<ScoredCandidate>, f64) {
    filtered.sort_by(|a, b| b.prob().total_cmp(&a.prob()));
    let probs: Vec<f64> = filtered.iter().map(|c| c.prob()).collect();
    let coverage = bounds
        .coverage_target
        .unwrap_or_else(|| adaptive_coverage(&probs));

    let mut rest = filtered.into_iter().peekable();
    let mut kept: Vec<ScoredCandidate> = Vec::new();
    let mut mass = 0.0;
    while kept.len() < bounds.max_return {
        let Some(candidate) = rest.next() else { break };
        mass += candidate.prob();
        kept.push(candidate);
        if kept.len() >= bounds.min_return && mass >= coverage {
            break;
        }
    }

    if kept.len() == 3 && kept.len() < bounds.max_return {
        if let Some(next) = rest.next_if(|c| c.prob() >= FOURTH_ITEM_FLOOR) {
            kept.push(next);
        }
    }
    (kept, coverage)
}

/// Pop from the tail toward `prefer_count` while at least `min_return`
/// remain and the mass stays within tolerance of `coverage`.
pub fn trim_to_preferred(shortlist: &mut Vec<ScoredCandidate>, bounds: &SelectionBounds, coverage: f64) {
    let mut mass: f64 = shortlist.iter().map(|c| c.prob()).sum();
    while shortlist.len() > bounds.prefer_count {
        let Some(last) = shortlist.last() else { break };
        let mass_after = mass - last.prob();
        if shortlist.len() - 1 < bounds.min_return || mass_after < coverage - TRIM_TOLERANCE {
            break;
        }
        shortlist.pop();
        mass = mass_after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::similarity::jaccard;
    use crate::engine::types::{FlowSignals, RawGeneration, VariantTag};

    fn candidate(text: &str, utility: f64, prob: f64, call_index: usize) -> ScoredCandidate {
        ScoredCandidate {
            generation: RawGeneration {
                text: text.to_string(),
                token_count: 3,
                avg_log_prob: -1.0,
                seed: call_index as u32,
                call_index,
                variant_tag: VariantTag::for_index(call_index),
            },
            flow: FlowSignals {
                sim_to_last_user: 0.0,
                length_penalty: 0.0,
                repetition_penalty: 0.0,
                total_penalty: 0.0,
                utility,
                prob,
            },
        }
    }

    fn texts(list: &[ScoredCandidate]) -> Vec<&str> {
        list.iter().map(|c| c.text()).collect()
    }

    #[test]
    fn bounds_are_clamped() {
        let b = SelectionBounds::new(Some(1), Some(10), Some(9), Some(1.5));
        assert_eq!((b.min_return, b.max_return, b.prefer_count), (3, 6, 6));
        assert_eq!(b.coverage_target, Some(1.0));

        let b = SelectionBounds::new(Some(5), Some(4), None, Some(-0.2));
        assert_eq!((b.min_return, b.max_return, b.prefer_count), (5, 5, 5));
        assert_eq!(b.coverage_target, None);

        let b = SelectionBounds::new(None, None, Some(1), None);
        assert_eq!(b.prefer_count, 3);
    }

    #[test]
    fn empty_scored_set_selects_nothing() {
        let selection = select(Vec::new(), &SelectionBounds::default());
        assert!(selection.candidates.is_empty());
        assert!(selection.coverage_target.is_none());
    }

    #[test]
    fn mmr_prefers_novel_text_over_slightly_better_copy() {
        let ordered = mmr_order(
            vec![
                candidate("let us grab coffee tomorrow morning", 1.0, 0.4, 0),
                candidate("let us grab coffee tomorrow", 0.95, 0.3, 1),
                candidate("how about a walk instead", 0.90, 0.3, 2),
            ],
            MMR_LAMBDA,
        );
        assert_eq!(
            texts(&ordered),
            vec![
                "let us grab coffee tomorrow morning",
                "how about a walk instead",
                "let us grab coffee tomorrow",
            ]
        );
    }

    #[test]
    fn duplicate_filter_uses_opening_words_and_overlap() {
        let ordered = vec![
            candidate("Sure thing, see you there", 1.0, 0.3, 0),
            candidate("Sure thing! Running late though", 0.9, 0.2, 1),
            candidate("Sounds great to me", 0.8, 0.2, 2),
            candidate("sounds great to me!", 0.7, 0.2, 3),
            candidate("Maybe another day", 0.6, 0.1, 4),
        ];
        let filtered = filter_near_duplicates(ordered, 3);
        assert_eq!(
            texts(&filtered),
            vec!["Sure thing, see you there", "Sounds great to me", "Maybe another day"]
        );
    }

    #[test]
    fn duplicate_filter_falls_back_when_too_few_survive() {
        let ordered = vec![
            candidate("ok ok", 1.0, 0.4, 0),
            candidate("ok ok!", 0.9, 0.3, 1),
            candidate("Ok, ok.", 0.8, 0.3, 2),
        ];
        let filtered = filter_near_duplicates(ordered.clone(), 3);
        assert_eq!(filtered, ordered);
    }

    #[test]
    fn long_and_short_pair_is_filtered_in_either_order() {
        let long = "extraordinarilylongwordhere a b c d e f g h i j k";
        let short = "a b c d e f g h i j k";
        assert!(long.chars().count() >= SHORT_TEXT_CHARS);
        assert!(short.chars().count() < SHORT_TEXT_CHARS);
        let overlap = jaccard(long, short);
        assert!(overlap >= DUPLICATE_THRESHOLD && overlap < SHORT_DUPLICATE_THRESHOLD);
        assert_eq!(pair_threshold(long, short), DUPLICATE_THRESHOLD);
        assert_eq!(pair_threshold(short, long), DUPLICATE_THRESHOLD);

        let others = [
            "Maybe another day",
            "How about tomorrow instead",
            "Let me check my calendar",
        ];
        for (first, second) in [(long, short), (short, long)] {
            let mut ordered = vec![
                candidate(first, 1.0, 0.3, 0),
                candidate(second, 0.9, 0.2, 1),
            ];
            for (i, text) in others.iter().enumerate() {
                ordered.push(candidate(text, 0.8 - 0.1 * i as f64, 0.1, i + 2));
            }
            let filtered = filter_near_duplicates(ordered, 3);
            let kept = texts(&filtered);
            assert_eq!(kept.len(), 4, "{kept:?}");
            assert_eq!(kept[0], first);
            assert!(!kept.contains(&second));
        }
    }

    #[test]
    fn threshold_depends_on_length() {
        assert_eq!(duplicate_threshold("short"), SHORT_DUPLICATE_THRESHOLD);
        assert_eq!(duplicate_threshold(&"x".repeat(45)), DUPLICATE_THRESHOLD);
    }

    #[test]
    fn entropy_drives_coverage() {
        assert!((normalized_entropy(&[0.25; 4]) - 1.0).abs() < 1e-12);
        assert_eq!(normalized_entropy(&[1.0, 0.0]), 0.0);
        assert_eq!(normalized_entropy(&[1.0]), 0.0);
        // pruned vectors are renormalized for entropy only
        assert!((normalized_entropy(&[0.1, 0.1]) - 1.0).abs() < 1e-12);

        assert!((adaptive_coverage(&[0.25; 4]) - 0.92).abs() < 1e-12);
        assert!((adaptive_coverage(&[1.0, 0.0]) - 0.84).abs() < 1e-12);
    }

    #[test]
    fn slice_stops_at_coverage_once_min_is_met() {
        let bounds = SelectionBounds::new(None, None, None, Some(0.9));
        let (kept, coverage) = coverage_slice(
            vec![
                candidate("a one", 0.1, 0.03, 3),
                candidate("b two", 0.1, 0.5, 0),
                candidate("c three", 0.1, 0.3, 1),
                candidate("d four", 0.1, 0.15, 2),
                candidate("e five", 0.1, 0.02, 4),
            ],
            &bounds,
        );
        assert_eq!(coverage, 0.9);
        assert_eq!(texts(&kept), vec!["b two", "c three", "d four"]);
    }

    #[test]
    fn slice_adds_fourth_when_not_too_small() {
        let bounds = SelectionBounds::new(None, None, None, Some(0.9));
        let (kept, _) = coverage_slice(
            vec![
                candidate("a", 0.1, 0.5, 0),
                candidate("b", 0.1, 0.3, 1),
                candidate("c", 0.1, 0.12, 2),
                candidate("d", 0.1, 0.05, 3),
                candidate("e", 0.1, 0.03, 4),
            ],
            &bounds,
        );
        assert_eq!(texts(&kept), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn slice_is_capped_at_max_return() {
        let bounds = SelectionBounds::new(Some(3), Some(4), None, Some(1.0));
        let pool: Vec<ScoredCandidate> = (0..6)
            .map(|i| candidate(&format!("text {i}"), 0.0, 1.0 / 6.0, i))
            .collect();
        let (kept, _) = coverage_slice(pool, &bounds);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn trim_pops_tail_while_mass_holds() {
        let bounds = SelectionBounds::new(Some(3), Some(6), Some(3), Some(0.5));
        let mut shortlist = vec![
            candidate("a", 0.0, 0.3, 0),
            candidate("b", 0.0, 0.25, 1),
            candidate("c", 0.0, 0.2, 2),
            candidate("d", 0.0, 0.15, 3),
        ];
        trim_to_preferred(&mut shortlist, &bounds, 0.5);
        assert_eq!(texts(&shortlist), vec!["a", "b", "c"]);
    }

    #[test]
    fn trim_stops_when_mass_would_drop_below_target() {
        let bounds = SelectionBounds::new(Some(3), Some(6), Some(3), None);
        let mut shortlist = vec![
            candidate("a", 0.0, 0.3, 0),
            candidate("b", 0.0, 0.25, 1),
            candidate("c", 0.0, 0.2, 2),
            candidate("d", 0.0, 0.15, 3),
            candidate("e", 0.0, 0.1, 4),
        ];
        trim_to_preferred(&mut shortlist, &bounds, 0.9);
        // 1.0 - 0.1 = 0.9 >= 0.89 pops "e"; 0.9 - 0.15 = 0.75 < 0.89 stops
        assert_eq!(shortlist.len(), 4);
    }

    #[test]
    fn output_is_sorted_by_utility_and_not_renormalized() {
        let scored = vec![
            candidate("first reply here", 0.60, 0.25, 0),
            candidate("second answer there", 0.75, 0.40, 1),
            candidate("third option now", 0.70, 0.35, 2),
        ];
        let selection = select(scored, &SelectionBounds::default());
        let utilities: Vec<f64> = selection.candidates.iter().map(|c| c.utility()).collect();
        assert_eq!(utilities, vec![0.75, 0.70, 0.60]);

        let selection = select(
            vec![
                candidate("alpha one", 0.9, 0.5, 0),
                candidate("beta two", 0.8, 0.3, 1),
                candidate("gamma three", 0.7, 0.15, 2),
                candidate("delta four", 0.1, 0.03, 3),
                candidate("epsilon five", 0.0, 0.02, 4),
            ],
            &SelectionBounds::new(None, None, None, Some(0.9)),
        );
        assert_eq!(selection.candidates.len(), 3);
        let mass: f64 = selection.candidates.iter().map(|c| c.prob()).sum();
        assert!((mass - 0.95).abs() < 1e-12);
    }
}
