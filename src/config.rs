//! Configuration file handling.
//!
//! Settings come from an optional `wordfreq.toml` (or the file passed with
//! `--config`). Every field has a default, so an empty or missing file yields a
//! working single-host setup. CLI flags are applied on top by `main`.

use crate::broker::queue::validate_queue_name;
use crate::error::ConfigError;
use crate::output::OutputFormat;
use crate::segmenter::types::DelimiterPolicy;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "wordfreq.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub queues: QueueNames,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the broker lives and how it hands out messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL used by the `worker`, `aggregator` and `dispatch` roles.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Listen address of the `broker` role.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Journal directory. Without it queues live in memory only.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Unacked messages are redelivered after this long.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Length of a single long-poll fetch.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            bind: default_bind(),
            data_dir: None,
            lease_ms: default_lease_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

fn default_broker_url() -> String {
    "http://127.0.0.1:5672".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:5672".to_string()
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_poll_ms() -> u64 {
    1_000
}

/// Names of the three pipeline queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    /// Work units, dispatcher to workers.
    #[serde(default = "default_task_queue")]
    pub task: String,

    /// Partial counts, workers to aggregator.
    #[serde(default = "default_partial_queue")]
    pub partial: String,

    /// Final histograms, aggregator to dispatcher.
    #[serde(default = "default_response_queue")]
    pub response: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            task: default_task_queue(),
            partial: default_partial_queue(),
            response: default_response_queue(),
        }
    }
}

fn default_task_queue() -> String {
    "task_queue".to_string()
}

fn default_partial_queue() -> String {
    "task_queue2".to_string()
}

fn default_response_queue() -> String {
    "resp_queue".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent counting workers per process.
    #[serde(default = "default_worker_count")]
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Skip partial counts whose unit id was already merged in the current run.
    #[serde(default = "default_true")]
    pub dedupe_redeliveries: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dedupe_redeliveries: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Where `wfc-<title>.*` and downloaded documents are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Give up waiting for the histogram after this many seconds. Unset waits forever.
    #[serde(default)]
    pub response_timeout_secs: Option<u64>,

    #[serde(default)]
    pub delimiter_policy: DelimiterPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            output_dir: default_output_dir(),
            response_timeout_secs: None,
            delimiter_policy: DelimiterPolicy::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl PipelineConfig {
    /// Loads `path`, or `wordfreq.toml` from the working directory if present, or the defaults.
    ///
    /// An explicitly given path must exist.
    /// Reads the configuration without validating it; flags applied afterwards may
    /// still correct a value, so callers run [`validate`](Self::validate) last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.count",
                message: "at least one worker is required".to_string(),
            });
        }
        if self.broker.poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.poll_ms",
                message: "must be positive".to_string(),
            });
        }
        if self.broker.lease_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.lease_ms",
                message: "must be positive".to_string(),
            });
        }

        let q = &self.queues;
        for name in [&q.task, &q.partial, &q.response] {
            if let Err(e) = validate_queue_name(name) {
                return Err(ConfigError::Invalid {
                    field: "queues",
                    message: e.to_string(),
                });
            }
        }
        if q.task == q.partial || q.task == q.response || q.partial == q.response {
            return Err(ConfigError::Invalid {
                field: "queues",
                message: "queue names must be distinct".to_string(),
            });
        }

        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.broker.lease_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.broker.poll_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.dispatcher.response_timeout_secs.map(Duration::from_secs)
    }
}
