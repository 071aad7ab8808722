//! Payload generation for bulk requests

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where payloads come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadSource {
    /// First number of the numeric range (inclusive)
    pub iterate_from: i64,
    /// End of the numeric range (exclusive)
    pub iterate_to: i64,
    /// Wordlist files (e.g. FuzzDB attack lists), one payload per line
    pub wordlists: Vec<PathBuf>,
    /// Literal payloads, appended after the range
    pub custom_payloads: Vec<String>,
}

impl PayloadSource {
    pub fn range(from: i64, to: i64) -> Self {
        Self {
            iterate_from: from,
            iterate_to: to,
            wordlists: Vec::new(),
            custom_payloads: Vec::new(),
        }
    }

    pub fn with_wordlist(mut self, path: impl Into<PathBuf>) -> Self {
        self.wordlists.push(path.into());
        self
    }

    pub fn with_custom(mut self, payloads: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.custom_payloads
            .extend(payloads.into_iter().map(Into::into));
        self
    }

    /// The numbers in `[iterate_from, iterate_to)` followed by the custom
    /// payloads. Wordlists are not read; see [`load`](Self::load).
    pub fn generate(&self) -> Vec<String> {
        let mut payloads = self.numbers();
        payloads.extend(self.custom_payloads.iter().cloned());
        payloads
    }

    /// Every payload: the numeric range, each wordlist's lines in order,
    /// then the custom payloads. Unreadable wordlists are skipped.
    pub async fn load(&self) -> Vec<String> {
        let mut payloads = self.numbers();
        for path in &self.wordlists {
            match tokio::fs::read(path).await {
                Ok(bytes) => payloads.extend(
                    String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(str::to_string),
                ),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable wordlist: {}", e)
                }
            }
        }
        payloads.extend(self.custom_payloads.iter().cloned());
        payloads
    }

    pub fn is_empty(&self) -> bool {
        self.iterate_from >= self.iterate_to
            && self.wordlists.is_empty()
            && self.custom_payloads.is_empty()
    }

    fn numbers(&self) -> Vec<String> {
        (self.iterate_from..self.iterate_to)
            .map(|i| i.to_string())
            .collect()
    }
}

/// Sniper combinations: each injection point in turn takes each payload
/// while the other points keep their original values.
pub fn sniper_combinations(originals: &[Vec<u8>], payloads: &[String]) -> Vec<Vec<Vec<u8>>> {
    let mut combinations = Vec::with_capacity(originals.len() * payloads.len());
    for point in 0..originals.len() {
        for payload in payloads {
            let mut combo = originals.to_vec();
            combo[point] = payload.as_bytes().to_vec();
            combinations.push(combo);
        }
    }
    combinations
}
