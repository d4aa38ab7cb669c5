//! Similarity between texts: lexical token overlap, or embedding cosine when
//! an embedding provider is configured.

use std::collections::HashSet;
use std::sync::Arc;

use crate::gateway::{Attribution, EmbedRequest, EmbeddingProvider};

/// How candidates are compared with the last user utterance.
///
/// Chosen once when the engine is built. `Semantic` still answers with
/// Jaccard for any candidate whose embedding is unusable, and for the whole
/// batch if the embedding call fails.
#[derive(Clone, Default)]
pub enum Similarity {
    #[default]
    Lexical,
    Semantic(Arc<dyn EmbeddingProvider>),
}

impl std::fmt::Debug for Similarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Similarity::Lexical => f.write_str("Lexical"),
            Similarity::Semantic(_) => f.write_str("Semantic"),
        }
    }
}

impl Similarity {
    pub fn is_semantic(&self) -> bool {
        matches!(self, Similarity::Semantic(_))
    }

    /// Similarity in [0, 1] of each text to `reference`, in input order.
    pub async fn to_reference(
        &self,
        reference: &str,
        texts: &[String],
        attribution: Attribution,
    ) -> Vec<f64> {
        let provider = match self {
            Similarity::Lexical => return lexical_to_reference(reference, texts),
            Similarity::Semantic(provider) => provider,
        };
        if texts.is_empty() {
            return Vec::new();
        }

        let mut batch = Vec::with_capacity(texts.len() + 1);
        batch.push(reference.to_string());
        batch.extend(texts.iter().cloned());

        let embeddings = match provider.embed(EmbedRequest::new(batch, attribution)).await {
            Ok(resp) if resp.embeddings.len() == texts.len() + 1 => resp.embeddings,
            Ok(resp) => {
                tracing::warn!(
                    expected = texts.len() + 1,
                    got = resp.embeddings.len(),
                    "Embedding count mismatch; using token overlap"
                );
                return lexical_to_reference(reference, texts);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Embedding failed; using token overlap");
                return lexical_to_reference(reference, texts);
            }
        };

        let reference_vec = &embeddings[0];
        texts
            .iter()
            .zip(&embeddings[1..])
            .enumerate()
            .map(|(i, (text, vector))| match cosine_unit(reference_vec, vector) {
                Some(sim) => sim,
                None => {
                    tracing::debug!(candidate = i, "Unusable embedding; using token overlap");
                    jaccard(reference, text)
                }
            })
            .collect()
    }
}

fn lexical_to_reference(reference: &str, texts: &[String]) -> Vec<f64> {
    let reference = token_set(reference);
    texts
        .iter()
        .map(|t| jaccard_sets(&reference, &token_set(t)))
        .collect()
}

/// Lowercased alphanumeric word tokens; punctuation is dropped.
pub fn word_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn token_set(text: &str) -> HashSet<String> {
    word_tokens(text).into_iter().collect()
}

pub fn jaccard_sets(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Token-level Jaccard overlap, case-insensitive and punctuation-stripped.
pub fn jaccard(a: &str, b: &str) -> f64 {
    jaccard_sets(&token_set(a), &token_set(b))
}

/// Cosine similarity rescaled from [-1, 1] to [0, 1].
///
/// `None` when the vectors are empty, differ in length, contain non-finite
/// values, or have zero norm.
pub fn cosine_unit(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return None;
    }
    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    Some(((cos + 1.0) / 2.0).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_ignore_case_and_punctuation() {
        assert_eq!(word_tokens("Hello, WORLD! it's"), vec!["hello", "world", "it", "s"]);
        assert!(word_tokens("...").is_empty());
    }

    #[test]
    fn jaccard_basics() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("Coffee?", "coffee"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert!((jaccard("a b c", "b c d") - 0.5).abs() < 1e-12);
        assert_eq!(jaccard("", ""), 0.0);
    }

    #[test]
    fn cosine_is_rescaled() {
        assert!((cosine_unit(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((cosine_unit(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 0.5).abs() < 1e-12);
        assert!(cosine_unit(&[1.0, 0.0], &[-1.0, 0.0]).unwrap().abs() < 1e-12);
    }

    #[test]
    fn cosine_rejects_bad_vectors() {
        assert!(cosine_unit(&[], &[]).is_none());
        assert!(cosine_unit(&[1.0], &[1.0, 2.0]).is_none());
        assert!(cosine_unit(&[0.0, 0.0], &[1.0, 2.0]).is_none());
        assert!(cosine_unit(&[f32::NAN, 1.0], &[1.0, 2.0]).is_none());
    }

    #[tokio::test]
    async fn lexical_similarity_scores_against_reference() {
        let texts = vec!["pizza tonight".to_string(), "no idea".to_string()];
        let sims = Similarity::Lexical
            .to_reference("pizza tonight?", &texts, Attribution::new("test"))
            .await;
        assert_eq!(sims, vec![1.0, 0.0]);
    }
}
