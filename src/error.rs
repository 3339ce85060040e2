//! Error taxonomy shared across the pipeline.
//!
//! - [`TransportError`]: anything the queue transport reports. Fatal for the role that hits it.
//! - [`SourceError`]: failure to acquire the input document. Aborts the run.
//! - [`OutputError`]: failure to persist the final histogram. Aborts the run.
//! - [`ConfigError`]: unreadable or invalid configuration.
//!
//! Malformed partial-count payloads are deliberately not represented here: the
//! aggregator logs and drops them without surfacing an error.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("queue not declared: {0}")]
    QueueNotFound(String),

    #[error("invalid queue name {0:?}: use ASCII letters, digits, '_' or '-'")]
    InvalidQueueName(String),

    #[error("queue {queue} already declared with durable={existing}")]
    QueueMismatch { queue: String, existing: bool },

    #[error("unknown consumer: {0}")]
    ConsumerNotFound(String),

    #[error("delivery {delivery_tag} is not outstanding for consumer {consumer}")]
    UnknownDelivery {
        consumer: String,
        delivery_tag: String,
    },

    #[error("journal error at {path}: {message}")]
    Journal { path: PathBuf, message: String },

    #[error("broker rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("timed out waiting on queue {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("failed to save downloaded copy to {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("histogram payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}
