//! Text Segmentation Module
//!
//! Turns a raw document into the ordered stream of work units the pipeline counts.
//!
//! ## Overview
//! A document is delimited by three kinds of lines: a `Title: ` line, a beginning
//! marker (a short line containing the word `I`, e.g. the first chapter heading) and
//! an end marker (`FIM`). Only the lines between the beginning and end markers are
//! counted. Every counted line is normalized so that the same text always yields the
//! same words.
//!
//! ## Submodules
//! - **`normalizer`**: Line normalization and marker detection.
//! - **`scanner`**: The line scan producing a `Segmentation`.
//! - **`types`**: `Document`, `WorkUnit`, `Segmentation` and the sentinel.

pub mod normalizer;
pub mod scanner;
pub mod types;
