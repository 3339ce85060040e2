//! Counting Worker Pool
//!
//! Each worker consumes one work unit at a time from the task queue, counts the
//! words of that line and publishes the partial count to the partial-result queue.
//! The unit is acknowledged only after the partial count has been published, so a
//! worker that dies mid-unit leaves it for redelivery.

use super::types::PartialCount;
use crate::broker::transport::{Consumer, Transport};
use crate::broker::types::{MessageProperties, OutboundMessage, QueueOptions};
use crate::config::PipelineConfig;
use crate::error::TransportError;

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Splits on single spaces and counts every token, including empty ones.
///
/// An empty line yields an empty count.
pub fn count_words(text: &str) -> PartialCount {
    let mut counts = PartialCount::default();
    if text.is_empty() {
        return counts;
    }

    for token in text.split(' ') {
        *counts.0.entry(token.to_string()).or_insert(0) += 1;
    }
    counts
}

/// One consumer on the task queue.
pub struct CountingWorker {
    id: usize,
    transport: Arc<dyn Transport>,
    consumer: Consumer,
    partial_queue: String,
}

impl CountingWorker {
    /// Declares both queues and subscribes to the task queue with a prefetch of one.
    pub async fn connect(
        id: usize,
        transport: Arc<dyn Transport>,
        config: &PipelineConfig,
    ) -> Result<Self, TransportError> {
        transport
            .declare_queue(&config.queues.task, QueueOptions::durable())
            .await?;
        transport
            .declare_queue(&config.queues.partial, QueueOptions::durable())
            .await?;

        let consumer =
            Consumer::subscribe(transport.clone(), &config.queues.task, 1, config.poll()).await?;

        Ok(Self {
            id,
            transport,
            consumer,
            partial_queue: config.queues.partial.clone(),
        })
    }

    /// Receives, counts, publishes and acknowledges a single unit.
    pub async fn process_one(&self) -> Result<PartialCount, TransportError> {
        let delivery = self.consumer.recv().await?;
        let text = String::from_utf8_lossy(&delivery.body);
        let counts = count_words(&text);

        let mut properties = MessageProperties::persistent("application/json");
        properties.unit_id = delivery.properties.unit_id.clone();
        let message = OutboundMessage::new(counts.to_bytes()?, properties);

        if let Err(e) = self.transport.publish(&self.partial_queue, message).await {
            tracing::error!(
                "Worker {} failed to publish partial count, requeueing unit: {}",
                self.id,
                e
            );
            self.consumer.nack(&delivery, true).await?;
            return Err(e);
        }

        match self.consumer.ack(&delivery).await {
            Ok(()) => {}
            // The lease ran out and the unit went back to the queue. Its partial is
            // already published and the aggregator skips the repeat.
            Err(TransportError::UnknownDelivery { .. }) => {
                tracing::warn!(
                    "Worker {} lost the lease on unit {}, it will be counted again",
                    self.id,
                    delivery.properties.unit_id.as_deref().unwrap_or("-")
                );
            }
            Err(e) => return Err(e),
        }
        tracing::debug!(
            "Worker {} counted unit {} ({} distinct words{})",
            self.id,
            delivery.properties.unit_id.as_deref().unwrap_or("-"),
            counts.0.len(),
            if delivery.redelivered { ", redelivered" } else { "" }
        );
        Ok(counts)
    }

    /// Processes units until a transport error occurs.
    pub async fn run(self) -> Result<(), TransportError> {
        tracing::info!("Worker {} consuming {}", self.id, self.consumer.queue());
        loop {
            if let Err(e) = self.process_one().await {
                let _ = self.consumer.cancel().await;
                return Err(e);
            }
        }
    }
}

/// Starts `config.worker.count` workers and waits for them.
///
/// Returns the first worker error; the other workers are stopped at that point.
pub async fn run_worker_pool(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Result<()> {
    tracing::info!("Starting {} counting workers", config.worker.count);

    let mut workers = JoinSet::new();
    for worker_id in 0..config.worker.count {
        let worker = CountingWorker::connect(worker_id, transport.clone(), config).await?;
        workers.spawn(worker.run());
    }

    let first = workers.join_next().await;
    workers.abort_all();

    match first {
        Some(Ok(Ok(()))) | None => Ok(()),
        Some(Ok(Err(e))) => Err(e.into()),
        Some(Err(join_error)) => Err(anyhow::anyhow!("worker task failed: {}", join_error)),
    }
}
