//! Transport Abstraction
//!
//! The pipeline roles only see the [`Transport`] trait. It is implemented by the
//! in-process [`Broker`] and by [`HttpTransport`](super::client::HttpTransport), so
//! the same worker/aggregator/dispatcher code runs in one process or across many.

use super::queue::Broker;
use super::types::*;
use crate::error::TransportError;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_queue(&self, queue: &str, options: QueueOptions)
        -> Result<(), TransportError>;

    async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError>;

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<ConsumerTag, TransportError>;

    /// Waits up to `wait` for the next delivery.
    async fn fetch(
        &self,
        consumer: &ConsumerTag,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, consumer: &ConsumerTag, delivery_tag: &MessageId)
        -> Result<(), TransportError>;

    async fn nack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
        requeue: bool,
    ) -> Result<(), TransportError>;

    async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), TransportError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, TransportError>;
}

#[async_trait]
impl Transport for Broker {
    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        Broker::declare_queue(self, queue, options).await
    }

    async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        Broker::publish(self, queue, message).await
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<ConsumerTag, TransportError> {
        Broker::consume(self, queue, prefetch).await
    }

    async fn fetch(
        &self,
        consumer: &ConsumerTag,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        Broker::fetch(self, consumer, wait).await
    }

    async fn ack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
    ) -> Result<(), TransportError> {
        Broker::ack(self, consumer, delivery_tag).await
    }

    async fn nack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
        requeue: bool,
    ) -> Result<(), TransportError> {
        Broker::nack(self, consumer, delivery_tag, requeue).await
    }

    async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), TransportError> {
        Broker::cancel(self, consumer).await
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
        Broker::stats(self, queue).await
    }
}

/// A subscription to one queue with a blocking receive loop.
pub struct Consumer {
    transport: Arc<dyn Transport>,
    tag: ConsumerTag,
    queue: String,
    poll: Duration,
}

impl Consumer {
    /// Registers a consumer on `queue` with the given prefetch limit.
    ///
    /// `poll` bounds a single fetch round trip; `recv` keeps polling until a message arrives.
    pub async fn subscribe(
        transport: Arc<dyn Transport>,
        queue: &str,
        prefetch: usize,
        poll: Duration,
    ) -> Result<Self, TransportError> {
        let tag = transport.consume(queue, prefetch).await?;
        Ok(Self {
            transport,
            tag,
            queue: queue.to_string(),
            poll,
        })
    }

    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Blocks until the next delivery arrives.
    pub async fn recv(&self) -> Result<Delivery, TransportError> {
        loop {
            if let Some(delivery) = self.transport.fetch(&self.tag, self.poll).await? {
                return Ok(delivery);
            }
        }
    }

    /// Like `recv`, but gives up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Delivery, TransportError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| TransportError::Timeout(self.queue.clone()))?
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.transport.ack(&self.tag, &delivery.delivery_tag).await
    }

    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.transport
            .nack(&self.tag, &delivery.delivery_tag, requeue)
            .await
    }

    /// Unsubscribes. Unacked deliveries go back to the queue.
    pub async fn cancel(self) -> Result<(), TransportError> {
        self.transport.cancel(&self.tag).await
    }
}
