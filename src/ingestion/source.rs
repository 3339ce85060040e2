use crate::error::SourceError;
use crate::segmenter::types::Document;

use std::path::{Path, PathBuf};

/// Where the input document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    /// Downloaded over HTTP(S); a copy is saved next to the output.
    Remote(String),
    Local(PathBuf),
}

impl DocumentSource {
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            DocumentSource::Remote(location.to_string())
        } else {
            DocumentSource::Local(PathBuf::from(location))
        }
    }

    /// Reads the document. Remote documents are first saved into `download_dir`
    /// under the last segment of their URL.
    pub async fn load(&self, download_dir: &Path) -> Result<Document, SourceError> {
        match self {
            DocumentSource::Local(path) => {
                let text = read_text(path).await?;
                tracing::info!("Read {} ({} bytes)", path.display(), text.len());
                Ok(Document::from_text(&text))
            }
            DocumentSource::Remote(url) => {
                tracing::info!("Downloading {} ...", url);
                let text = fetch_text(url).await?;

                let saved = download_dir.join(download_file_name(url));
                tokio::fs::write(&saved, text.as_bytes())
                    .await
                    .map_err(|source| SourceError::Save {
                        path: saved.clone(),
                        source,
                    })?;
                tracing::info!("Saved {} bytes to {}", text.len(), saved.display());

                Ok(Document::from_text(&text))
            }
        }
    }
}

/// Last non-empty URL path segment, falling back to `document.txt`.
pub fn download_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .find(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("document.txt")
        .to_string()
}

async fn read_text(path: &Path) -> Result<String, SourceError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| SourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn fetch_text(url: &str) -> Result<String, SourceError> {
    let download_error = |source: reqwest::Error| SourceError::Download {
        url: url.to_string(),
        source,
    };

    let response = reqwest::get(url).await.map_err(download_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::BadStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(download_error)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
