//! Document Ingestion Module
//!
//! Acquires the input text for a run.
//!
//! ## Workflow
//! 1. **Resolve**: A location is either an `http(s)://` URL or a local path.
//! 2. **Download**: Remote documents are fetched and a copy is saved locally.
//! 3. **Read**: The text is decoded (lossily, if needed) and split into lines.

pub mod source;
