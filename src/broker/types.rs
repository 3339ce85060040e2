use serde::{Deserialize, Serialize};

/// Unique identifier for a message within the broker.
///
/// Doubles as the delivery tag a consumer uses to ack or nack the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generates a new random UUID v4-based MessageId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one registered consumer (a subscription to a single queue).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl ConsumerTag {
    pub fn new() -> Self {
        Self(format!("ctag-{}", uuid::Uuid::new_v4()))
    }
}

impl Default for ConsumerTag {
    fn default() -> Self {
        Self::new()
    }
}

/// Options supplied when declaring a queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueOptions {
    /// Durable queues survive a broker restart when the broker has a data dir.
    pub durable: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self { durable: true }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// Metadata travelling alongside a message body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type of the body, e.g. `text/plain` for work units.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Pipeline-level identity of the work unit this message derives from (`<run_id>:<seq>`).
    #[serde(default)]
    pub unit_id: Option<String>,
    /// Run a final histogram belongs to. Set on responses only.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Persistent messages in durable queues are written to the journal.
    #[serde(default)]
    pub persistent: bool,
}

impl MessageProperties {
    pub fn persistent(content_type: &str) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            unit_id: None,
            run_id: None,
            persistent: true,
        }
    }

    pub fn with_unit_id(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// A message as handed to `publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }
}

/// A message handed to a consumer. Must be acked or nacked by `delivery_tag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_tag: MessageId,
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// True when this message was handed out before and never acknowledged.
    pub redelivered: bool,
    /// How many times the broker has handed out this message, including this time.
    pub delivery_count: u32,
}

/// Lifecycle state of a stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageStatus {
    /// Waiting in the ready list.
    Ready,
    /// Handed to a consumer and awaiting ack.
    /// The delivery lease expires at `lease_expires` (ms since epoch).
    Unacked {
        consumer: ConsumerTag,
        lease_expires: u64,
    },
}

/// The internal representation of a message stored in a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: MessageId,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub status: MessageStatus,
    pub delivery_count: u32,
    /// Timestamp (ms) when the message was published.
    pub published_at: u64,
    /// Broker-wide publish order; redelivered messages keep their place by it.
    #[serde(default)]
    pub sequence: u64,
}

impl MessageEntry {
    pub fn is_unacked(&self) -> bool {
        matches!(self.status, MessageStatus::Unacked { .. })
    }
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
