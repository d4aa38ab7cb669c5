//! Text normalization for raw generations.
//!
//! Models leak prompt structure into their output: role labels, bracketed
//! meta-tags, code fences, a re-emitted next turn. `normalize` strips that and
//! collapses whitespace; `clean_generations` drops what ends up empty.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::RawGeneration;

const MAX_META_BLOCK_CHARS: usize = 40;

static FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```(?:[A-Za-z0-9_+\-]*[ \t]*\n)?").expect("Invalid fence regex"));

static FENCE_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n?[ \t]*```\s*$").expect("Invalid fence regex"));

static LEADING_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^\[[^\]\n]{{0,{MAX_META_BLOCK_CHARS}}}\]\s*"))
        .expect("Invalid meta block regex")
});

static LEADING_ROLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:assistant|ai|bot|system|user|reply|response|answer)\s*(?::|-\s)\s*")
        .expect("Invalid role label regex")
});

static TRAILING_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\n\s*(?:user|assistant|system|human|ai)\s*:|\[/?INST\]|\[SYSTEM\]|\[END\]|<\||###")
        .expect("Invalid trailing meta regex")
});

static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}\x{FE00}-\x{FE0F}\x{200D}\x{E0020}-\x{E007F}]",
    )
    .expect("Invalid emoji regex")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

const QUOTE_PAIRS: [(char, char); 5] = [
    ('"', '"'),
    ('\'', '\''),
    ('\u{201C}', '\u{201D}'),
    ('\u{2018}', '\u{2019}'),
    ('\u{00AB}', '\u{00BB}'),
];

/// Clean one raw output. May return an empty string.
pub fn normalize(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    text = FENCE_OPEN.replace(&text, "").into_owned();
    text = FENCE_CLOSE.replace(&text, "").into_owned();
    text = text.replace("```", "");
    text = text.trim().to_string();

    text = strip_leading_meta(text);

    if let Some(m) = TRAILING_META.find(&text) {
        text.truncate(m.start());
    }

    text = EMOJI.replace_all(&text, "").into_owned();
    text = WHITESPACE.replace_all(&text, " ").into_owned();
    text = strip_wrapping_quotes(text.trim());
    text.trim().to_string()
}

/// Drop a leading speaker label such as `User:` from a transcript line.
pub fn strip_role_label(line: &str) -> &str {
    let line = line.trim();
    match LEADING_ROLE.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// Normalize every generation, keeping only non-empty results.
pub fn clean_generations(raw: Vec<RawGeneration>) -> Vec<RawGeneration> {
    raw.into_iter()
        .filter_map(|mut generation| {
            let cleaned = normalize(&generation.text);
            if cleaned.is_empty() {
                tracing::debug!(
                    call_index = generation.call_index,
                    "Generation empty after normalization"
                );
                return None;
            }
            generation.text = cleaned;
            Some(generation)
        })
        .collect()
}

// Labels can stack ("[SYSTEM] Assistant: ..."), so strip until stable.
fn strip_leading_meta(mut text: String) -> String {
    loop {
        let before = text.len();
        text = LEADING_META.replace(&text, "").into_owned();
        text = LEADING_ROLE.replace(&text, "").into_owned();
        text = text.trim_start().to_string();
        if text.len() == before {
            return text;
        }
    }
}

fn strip_wrapping_quotes(text: &str) -> String {
    let mut current = text;
    loop {
        let trimmed = current.trim();
        let stripped = QUOTE_PAIRS.iter().find_map(|&(open, close)| {
            let inner = trimmed.strip_prefix(open)?.strip_suffix(close)?;
            Some(inner)
        });
        match stripped {
            Some(inner) => current = inner,
            None => return trimmed.to_string(),
        }
    }
}
