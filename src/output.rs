//! Histogram output files.
//!
//! The dispatcher writes the final histogram to `wfc-<title>.txt` or
//! `wfc-<title>.json` in the configured output directory.

use crate::error::OutputError;
use crate::pipeline::types::FinalHistogram;

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One `word count` line per word, most frequent first.
    #[default]
    Txt,
    /// Pretty-printed JSON object.
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Json => "json",
        }
    }
}

/// `wfc-<title>.<ext>` under `dir`. Path separators in the title become `_`.
pub fn output_path(dir: &Path, title: &str, format: OutputFormat) -> PathBuf {
    let safe_title: String = title
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    dir.join(format!("wfc-{}.{}", safe_title, format.extension()))
}

pub fn render(histogram: &FinalHistogram, format: OutputFormat) -> Result<Vec<u8>, OutputError> {
    match format {
        OutputFormat::Json => Ok(histogram.to_pretty_json()?),
        OutputFormat::Txt => {
            let mut text = String::new();
            for (word, count) in histogram.by_frequency() {
                let _ = writeln!(text, "{} {}", word, count);
            }
            Ok(text.into_bytes())
        }
    }
}

/// Writes the histogram and returns the file path and the number of bytes written.
pub async fn write_histogram(
    dir: &Path,
    title: &str,
    histogram: &FinalHistogram,
    format: OutputFormat,
) -> Result<(PathBuf, usize), OutputError> {
    let path = output_path(dir, title, format);
    let bytes = render(histogram, format)?;

    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| OutputError::Write {
            path: path.clone(),
            source,
        })?;

    tracing::info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok((path, bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn histogram(pairs: &[(&str, u64)]) -> FinalHistogram {
        FinalHistogram(
            pairs
                .iter()
                .map(|(w, c)| (w.to_string(), *c))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_output_path_naming() {
        let dir = Path::new("/tmp/out");

        assert_eq!(
            output_path(dir, "Dom Casmurro", OutputFormat::Txt),
            PathBuf::from("/tmp/out/wfc-Dom Casmurro.txt")
        );
        assert_eq!(
            output_path(dir, " a/b ", OutputFormat::Json),
            PathBuf::from("/tmp/out/wfc-a_b.json")
        );
        assert_eq!(
            output_path(dir, "", OutputFormat::Txt),
            PathBuf::from("/tmp/out/wfc-.txt")
        );
    }

    #[test]
    fn test_render_txt_sorted_by_frequency() {
        let h = histogram(&[("world", 1), ("hello", 2), ("abc", 1)]);

        let text = String::from_utf8(render(&h, OutputFormat::Txt).unwrap()).unwrap();

        assert_eq!(text, "hello 2\nabc 1\nworld 1\n");
    }

    #[test]
    fn test_render_json_is_pretty_object() {
        let h = histogram(&[("hello", 2), ("world", 1)]);

        let bytes = render(&h, OutputFormat::Json).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.contains("\n  \"hello\": 2"));
        assert_eq!(FinalHistogram::from_bytes(&bytes).unwrap(), h);
    }

    #[tokio::test]
    async fn test_write_histogram_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let h = histogram(&[("hello", 2), ("world", 1)]);

        let (path, written) = write_histogram(dir.path(), "Sample", &h, OutputFormat::Txt)
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("wfc-Sample.txt"));
        assert_eq!(written, "hello 2\nworld 1\n".len());
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello 2\nworld 1\n");
    }

    #[tokio::test]
    async fn test_write_histogram_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = write_histogram(&missing, "T", &FinalHistogram::default(), OutputFormat::Json)
            .await
            .unwrap_err();

        assert!(matches!(err, OutputError::Write { .. }));
    }
}
