use super::normalizer::{extract_title, is_end_marker};

use serde::{Deserialize, Serialize};

/// End-of-stream marker. Normalized text can never contain it because `<` and `>`
/// are stripped by the normalizer.
pub const SENTINEL: &str = "<EoF>";

/// A raw document as read from its source, one entry per line.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Text after the last `Title: ` marker ahead of the end marker, as the scan would report it.
    pub title: Option<String>,
    pub lines: Vec<String>,
}

impl Document {
    pub fn from_text(text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let title = lines
            .iter()
            .take_while(|line| !is_end_marker(line))
            .filter_map(|line| extract_title(line))
            .last();

        Self { title, lines }
    }
}

/// One line of normalized body text, or the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit(pub String);

impl WorkUnit {
    pub fn sentinel() -> Self {
        Self(SENTINEL.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How the delimiter units (title line, beginning marker) are removed from the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelimiterPolicy {
    /// Drop exactly the first two emitted units, whatever they are.
    /// Loses real body lines when the title or the beginning marker is missing.
    DropLeadingTwo,
    /// Drop only the title and beginning-marker units that were actually emitted.
    #[default]
    DropEmittedDelimiters,
}

impl std::str::FromStr for DelimiterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_leading_two" => Ok(Self::DropLeadingTwo),
            "drop_emitted_delimiters" => Ok(Self::DropEmittedDelimiters),
            other => Err(format!("unknown delimiter policy: {}", other)),
        }
    }
}

/// Result of scanning a document: the extracted title and the ordered work units,
/// always terminated by exactly one sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation {
    /// Title text as it appeared after the `Title: ` marker, empty if none was found.
    pub title: String,
    pub units: Vec<WorkUnit>,
}

impl Segmentation {
    /// Number of units excluding the sentinel.
    pub fn body_len(&self) -> usize {
        self.units.len().saturating_sub(1)
    }
}
