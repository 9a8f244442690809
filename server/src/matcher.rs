use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Acceptance cutoff for canned answers. The comparison is strictly
/// greater-than: a best score of exactly 0.5 still falls through to the
/// AI backends.
pub const MATCH_THRESHOLD: f64 = 0.5;

/// Static table of pre-authored question/answer pairs, checked before any
/// AI backend is called. Loaded once at startup and shared read-only for
/// the process lifetime.
#[derive(Debug, Clone)]
pub struct CannedTable {
    entries: Vec<CannedEntry>,
}

#[derive(Debug, Clone)]
struct CannedEntry {
    /// Lowercase tokens of the canonical question, joined by single
    /// spaces. Precomputed so request handling only scores.
    key: String,
    answer: String,
}

impl CannedTable {
    /// Loads the table from a JSON object file (key = canonical question,
    /// value = answer). A missing file yields an empty table; a present
    /// but malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    target: "chat",
                    path = %path.display(),
                    msg = "canned responses file missing; starting with an empty table"
                );
                return Ok(Self {
                    entries: Vec::new(),
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read canned responses from {path:?}"))
            }
        };

        let object: serde_json::Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse JSON object from {path:?}"))?;

        let mut pairs = Vec::with_capacity(object.len());
        for (question, value) in object {
            let Value::String(answer) = value else {
                bail!("Canned answer for {question:?} in {path:?} is not a string");
            };
            pairs.push((question, answer));
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Builds a table directly from question/answer pairs. Iteration order
    /// is the insertion order of `pairs`, which decides ties in
    /// [`CannedTable::best_match`].
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let entries = pairs
            .into_iter()
            .map(|(question, answer)| CannedEntry {
                key: tokenize(&question).join(" "),
                answer,
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the answer of the most similar canonical question, provided
    /// its score strictly exceeds [`MATCH_THRESHOLD`]. On equal scores the
    /// earliest-inserted key wins. An empty table never matches.
    pub fn best_match(&self, question: &str) -> Option<&str> {
        let needle = tokenize(question).join(" ");

        let mut best: Option<&CannedEntry> = None;
        let mut highest = 0.0_f64;
        for entry in &self.entries {
            let similarity = dice_coefficient(&needle, &entry.key);
            if similarity > highest {
                highest = similarity;
                best = Some(entry);
            }
        }

        if highest > MATCH_THRESHOLD {
            best.map(|entry| entry.answer.as_str())
        } else {
            None
        }
    }
}

/// Splits text into lowercase word tokens on any non-alphanumeric
/// boundary, discarding punctuation and empty fragments.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect()
}

/// Character-bigram Dice coefficient between two strings:
/// `2 * |shared| / (|bigrams(a)| + |bigrams(b)|)`, with bigrams counted as
/// multisets. Returns 0.0 when neither input has a bigram.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    let bigrams_a = bigram_counts(a);
    let bigrams_b = bigram_counts(b);

    let total = bigrams_a.values().sum::<usize>() + bigrams_b.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }

    let shared: usize = bigrams_a
        .iter()
        .map(|(bigram, count)| bigrams_b.get(bigram).map_or(0, |other| (*count).min(*other)))
        .sum();

    2.0 * shared as f64 / total as f64
}

fn bigram_counts(text: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}
