//! Append-only journal for durable queues.
//!
//! Each durable queue owns `<data_dir>/<queue>.log` with one JSON record per line:
//! a `declare` header followed by `publish`, `deliver` and `remove` records.
//! Replaying the lines rebuilds the persistent messages of the queue.
//!
//! A log is rewritten with only its live messages when the broker opens it, and
//! again once it holds more than [`COMPACT_THRESHOLD`] records that are mostly dead.
//! Rewrites go to a temporary file that is renamed into place.

use super::types::{MessageEntry, MessageId, MessageProperties, MessageStatus, QueueOptions};
use crate::error::TransportError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Record count below which a log is never compacted.
pub const COMPACT_THRESHOLD: usize = 1024;

const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Declare { options: QueueOptions },
    Publish { message: JournaledMessage },
    Deliver { id: MessageId },
    Remove { id: MessageId },
}

/// The durable part of a [`MessageEntry`]. Lease state is never journaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournaledMessage {
    pub id: MessageId,
    pub body: JournalBody,
    pub properties: MessageProperties,
    pub delivery_count: u32,
    pub published_at: u64,
    pub sequence: u64,
}

/// Work units and counts are UTF-8, so bodies are kept as text whenever they decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JournalBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&[u8]> for JournalBody {
    fn from(body: &[u8]) -> Self {
        match std::str::from_utf8(body) {
            Ok(text) => JournalBody::Text(text.to_string()),
            Err(_) => JournalBody::Bytes(body.to_vec()),
        }
    }
}

impl From<JournalBody> for Vec<u8> {
    fn from(body: JournalBody) -> Self {
        match body {
            JournalBody::Text(text) => text.into_bytes(),
            JournalBody::Bytes(bytes) => bytes,
        }
    }
}

impl From<&MessageEntry> for JournaledMessage {
    fn from(entry: &MessageEntry) -> Self {
        Self {
            id: entry.id.clone(),
            body: JournalBody::from(entry.body.as_slice()),
            properties: entry.properties.clone(),
            delivery_count: entry.delivery_count,
            published_at: entry.published_at,
            sequence: entry.sequence,
        }
    }
}

impl From<JournaledMessage> for MessageEntry {
    fn from(message: JournaledMessage) -> Self {
        Self {
            id: message.id,
            body: message.body.into(),
            properties: message.properties,
            status: MessageStatus::Ready,
            delivery_count: message.delivery_count,
            published_at: message.published_at,
            sequence: message.sequence,
        }
    }
}

/// A queue rebuilt from its log, messages in publish order.
#[derive(Debug)]
pub struct RestoredQueue {
    pub queue: String,
    pub options: QueueOptions,
    pub messages: Vec<MessageEntry>,
}

pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| journal_error(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replays every queue log in the data dir.
    ///
    /// Logs without a `declare` header are skipped, as are lines that fail to
    /// parse (a torn final line after a crash).
    pub async fn load_all(&self) -> Result<Vec<RestoredQueue>, TransportError> {
        let mut restored = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| journal_error(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| journal_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(queue) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| journal_error(&path, e))?;
            match replay(queue, &raw) {
                Some(queue) => restored.push(queue),
                None => tracing::warn!("Skipping journal {} without a declare record", path.display()),
            }
        }

        Ok(restored)
    }

    /// Replaces the log of `queue` with a header plus one `publish` record per message.
    pub async fn rewrite(
        &self,
        queue: &str,
        options: QueueOptions,
        messages: &[&MessageEntry],
    ) -> Result<QueueLog, TransportError> {
        let path = self.path_for(queue);
        let tmp = path.with_extension("log.tmp");

        let mut bytes = encode(&JournalRecord::Declare { options })?;
        for entry in messages {
            bytes.extend(encode(&JournalRecord::Publish {
                message: JournaledMessage::from(*entry),
            })?);
        }

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| journal_error(&tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| journal_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| journal_error(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| journal_error(&path, e))?;

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| journal_error(&path, e))?;

        tracing::trace!("Rewrote journal of {} with {} messages", queue, messages.len());
        Ok(QueueLog {
            path,
            file,
            records: messages.len() + 1,
            live: messages.len(),
        })
    }

    /// Queue names are restricted to `[A-Za-z0-9_-]` at declare time, so they map to file names as-is.
    fn path_for(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", queue, LOG_EXTENSION))
    }
}

/// Open append handle on one queue's log.
pub struct QueueLog {
    path: PathBuf,
    file: tokio::fs::File,
    records: usize,
    live: usize,
}

impl QueueLog {
    pub async fn append(&mut self, record: &JournalRecord) -> Result<(), TransportError> {
        let line = encode(record)?;
        self.file
            .write_all(&line)
            .await
            .map_err(|e| journal_error(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| journal_error(&self.path, e))?;

        self.records += 1;
        match record {
            JournalRecord::Publish { .. } => self.live += 1,
            JournalRecord::Remove { .. } => self.live = self.live.saturating_sub(1),
            _ => {}
        }
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// True once the log is past the threshold and live messages account for under a quarter of it.
    pub fn needs_compaction(&self) -> bool {
        self.records > COMPACT_THRESHOLD && self.records > 4 * (self.live + 1)
    }
}

fn encode(record: &JournalRecord) -> Result<Vec<u8>, TransportError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

fn replay(queue: &str, raw: &str) -> Option<RestoredQueue> {
    let mut options = None;
    let mut messages: HashMap<MessageId, MessageEntry> = HashMap::new();

    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping unreadable record {} of queue {}: {}", number + 1, queue, e);
                continue;
            }
        };

        match record {
            JournalRecord::Declare { options: declared } => options = Some(declared),
            JournalRecord::Publish { message } => {
                messages.insert(message.id.clone(), MessageEntry::from(message));
            }
            JournalRecord::Deliver { id } => {
                if let Some(entry) = messages.get_mut(&id) {
                    entry.delivery_count += 1;
                }
            }
            JournalRecord::Remove { id } => {
                messages.remove(&id);
            }
        }
    }

    let mut messages: Vec<MessageEntry> = messages.into_values().collect();
    messages.sort_by_key(|entry| entry.sequence);

    Some(RestoredQueue {
        queue: queue.to_string(),
        options: options?,
        messages,
    })
}

fn journal_error(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::Journal {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
