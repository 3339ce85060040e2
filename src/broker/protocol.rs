//! Broker Network Protocol
//!
//! Defines the HTTP endpoints and Data Transfer Objects (DTOs) used between
//! pipeline processes and a standalone broker.
//!
//! Queue-scoped routes live under `/queues/:name`, consumer-scoped routes under
//! `/consumers/:tag`. The `*_path` helpers build concrete URLs for the client.

use super::queue::validate_queue_name;
use super::types::*;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_DECLARE: &str = "/queues/:name/declare";
pub const ENDPOINT_PUBLISH: &str = "/queues/:name/publish";
pub const ENDPOINT_CONSUME: &str = "/queues/:name/consume";
pub const ENDPOINT_STATS: &str = "/queues/:name/stats";
pub const ENDPOINT_FETCH: &str = "/consumers/:tag/fetch";
pub const ENDPOINT_ACK: &str = "/consumers/:tag/ack";
pub const ENDPOINT_NACK: &str = "/consumers/:tag/nack";
pub const ENDPOINT_CANCEL: &str = "/consumers/:tag";

/// Builds a queue route. Names outside `[A-Za-z0-9_-]` never reach the URL.
pub fn queue_path(queue: &str, action: &str) -> Result<String, TransportError> {
    validate_queue_name(queue)?;
    Ok(format!("/queues/{}/{}", queue, action))
}

pub fn consumer_path(tag: &ConsumerTag, action: Option<&str>) -> Result<String, TransportError> {
    let safe = tag
        .0
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if tag.0.is_empty() || !safe {
        return Err(TransportError::ConsumerNotFound(tag.0.clone()));
    }
    Ok(match action {
        Some(action) => format!("/consumers/{}/{}", tag.0, action),
        None => format!("/consumers/{}", tag.0),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeclareQueueRequest {
    pub options: QueueOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub prefetch: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumeResponse {
    pub consumer_tag: ConsumerTag,
}

/// Long-poll request: the server holds the request for up to `wait_ms`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub delivery: Option<Delivery>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub delivery_tag: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NackRequest {
    pub delivery_tag: MessageId,
    pub requeue: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queues: Vec<String>,
}
