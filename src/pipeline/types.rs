use crate::segmenter::types::SENTINEL;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Word -> occurrences for a single work unit.
///
/// Serialized as a plain JSON object (`{"hello":1,"world":1}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialCount(pub BTreeMap<String, u64>);

impl PartialCount {
    pub fn get(&self, word: &str) -> u64 {
        self.0.get(word).copied().unwrap_or(0)
    }

    pub fn contains_sentinel(&self) -> bool {
        self.0.contains_key(SENTINEL)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl<const N: usize> From<[(&str, u64); N]> for PartialCount {
    fn from(pairs: [(&str, u64); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(word, count)| (word.to_string(), count))
                .collect(),
        )
    }
}

/// The finished histogram of one run: never contains the sentinel or the empty word.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalHistogram(pub BTreeMap<String, u64>);

impl FinalHistogram {
    pub fn get(&self, word: &str) -> u64 {
        self.0.get(word).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all counts.
    pub fn total_words(&self) -> u64 {
        self.0.values().sum()
    }

    /// Entries by descending count, ties broken alphabetically.
    pub fn by_frequency(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<(&str, u64)> = self
            .0
            .iter()
            .map(|(word, count)| (word.as_str(), *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Identity of one work unit within one run, carried in message properties.
pub fn unit_id(run_id: &str, seq: usize) -> String {
    format!("{}:{}", run_id, seq)
}
