//! Command-line interface argument parsing.
//!
//! Flags given here override the values loaded from the configuration file.

use crate::config::PipelineConfig;
use crate::output::OutputFormat;
use crate::segmenter::types::DelimiterPolicy;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// wordfreq - word-frequency histograms over a queue pipeline
///
/// Examples:
///   wordfreq run books/dom_casmurro.txt --workers 8
///   wordfreq broker --bind 0.0.0.0:5672 --data-dir /var/lib/wordfreq
///   wordfreq worker --broker-url http://broker:5672 --workers 4
///   wordfreq aggregator --broker-url http://broker:5672
///   wordfreq dispatch https://www.gutenberg.org/cache/epub/55752/pg55752.txt --format json
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    ///
    /// If not specified, looks for wordfreq.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Broker base URL for the worker, aggregator and dispatch roles
    #[arg(long, global = true, value_name = "URL", env = "WORDFREQ_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the message broker over HTTP
    Broker {
        /// Listen address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Journal directory for durable queues
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Run counting workers against a remote broker
    Worker {
        /// Number of concurrent workers
        #[arg(short, long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Run the merge aggregator against a remote broker
    Aggregator,

    /// Send one document through a remote pipeline and write its histogram
    Dispatch(DispatchArgs),

    /// Run the whole pipeline in this process
    Run {
        #[command(flatten)]
        dispatch: DispatchArgs,

        /// Number of concurrent workers
        #[arg(short, long, value_name = "N")]
        workers: Option<usize>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    /// Local file path or http(s) URL of the document
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Histogram file format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Directory for the histogram and downloaded documents
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// How the title and beginning-marker units are removed
    /// (drop_emitted_delimiters or drop_leading_two)
    #[arg(long, value_name = "POLICY")]
    pub delimiter_policy: Option<DelimiterPolicy>,

    /// Give up waiting for the histogram after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl Cli {
    /// Applies every flag that was given on top of `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(url) = &self.broker_url {
            config.broker.url = url.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        match &self.command {
            Command::Broker { bind, data_dir } => {
                if let Some(bind) = bind {
                    config.broker.bind = bind.clone();
                }
                if let Some(dir) = data_dir {
                    config.broker.data_dir = Some(dir.clone());
                }
            }
            Command::Worker { workers } => apply_workers(config, *workers),
            Command::Aggregator => {}
            Command::Dispatch(args) => args.apply(config),
            Command::Run { dispatch, workers } => {
                dispatch.apply(config);
                apply_workers(config, *workers);
            }
        }
    }
}

impl DispatchArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(format) = self.format {
            config.dispatcher.format = format;
        }
        if let Some(dir) = &self.output_dir {
            config.dispatcher.output_dir = dir.clone();
        }
        if let Some(policy) = self.delimiter_policy {
            config.dispatcher.delimiter_policy = policy;
        }
        if let Some(secs) = self.timeout {
            config.dispatcher.response_timeout_secs = Some(secs);
        }
    }
}

fn apply_workers(config: &mut PipelineConfig, workers: Option<usize>) {
    if let Some(count) = workers {
        config.worker.count = count;
    }
}
