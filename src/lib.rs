//! Word-Frequency Pipeline Library
//!
//! Computes the word histogram of a plain-text document by fanning its lines out
//! to counting workers over durable queues and merging their partial counts.
//! The binary (`main.rs`) wires these modules into CLI roles.
//!
//! ## Architecture Modules
//! - **`broker`**: Named durable queues with prefetch, manual ack and lease-based
//!   redelivery, usable in-process or over HTTP through the `Transport` trait.
//! - **`segmenter`**: Line normalization and the title/beginning/end marker scan that
//!   turns a document into work units terminated by the `<EoF>` sentinel.
//! - **`pipeline`**: The dispatcher, counting worker and merge aggregator roles.
//! - **`ingestion`**: Loads the source document from disk or over HTTP.
//! - **`output`**: Writes the final histogram as text or JSON.
//! - **`config`** / **`cli`**: TOML configuration and its command-line overrides.

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod output;
pub mod pipeline;
pub mod segmenter;
