//! In-Process Message Broker
//!
//! Implements named FIFO queues with manual acknowledgement, per-consumer prefetch
//! limits and lease-based redelivery. This is the component every pipeline role
//! ultimately talks to, either directly (single-process mode) or through the HTTP
//! front end in `handlers`.
//!
//! ## Responsibilities
//! - **Queueing**: Messages are handed out in publish order, one consumer at a time.
//! - **Flow control**: A consumer never holds more unacked messages than its prefetch.
//! - **Redelivery**: Nacked messages, messages of cancelled consumers and messages
//!   whose lease expired go back to the head of the queue, flagged as redelivered.
//! - **Durability**: Persistent messages of durable queues are appended to a journal
//!   when a data dir is set.

use super::journal::{Journal, JournalRecord, JournaledMessage, QueueLog};
use super::types::*;
use crate::error::TransportError;

use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Default delivery lease, after which an unacked message is handed out again.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Upper bound on how long a blocked fetch sleeps before re-checking expired leases.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct ConsumerSlot {
    prefetch: usize,
    in_flight: HashSet<MessageId>,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<MessageId>,
    entries: HashMap<MessageId, MessageEntry>,
    consumers: HashMap<ConsumerTag, ConsumerSlot>,
    /// Set for durable queues of a journaled broker.
    log: Option<QueueLog>,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// The central component managing queue state.
pub struct Broker {
    /// Declared queues by name.
    queues: DashMap<String, Arc<QueueState>>,
    /// Routes a consumer tag to the queue it subscribed to.
    consumers: DashMap<ConsumerTag, String>,
    journal: Option<Journal>,
    lease: Duration,
    next_sequence: AtomicU64,
}

impl Broker {
    /// Creates a purely in-memory broker.
    pub fn new(lease: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            consumers: DashMap::new(),
            journal: None,
            lease,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Opens a broker backed by a journal directory, restoring any durable queues found there.
    ///
    /// Restored messages are all `Ready`; anything that was unacked at shutdown
    /// is redelivered. Every restored log is compacted to its live messages.
    pub async fn open(data_dir: impl Into<PathBuf>, lease: Duration) -> Result<Self, TransportError> {
        let journal = Journal::open(data_dir).await?;
        let restored = journal.load_all().await?;
        tracing::info!(
            "Loaded {} queue journals from {}",
            restored.len(),
            journal.dir().display()
        );

        let next_sequence = restored
            .iter()
            .flat_map(|queue| queue.messages.iter())
            .map(|entry| entry.sequence + 1)
            .max()
            .unwrap_or(0);

        let queues = DashMap::new();
        for restored in restored {
            if validate_queue_name(&restored.queue).is_err() {
                tracing::warn!("Ignoring journal of invalid queue name {:?}", restored.queue);
                continue;
            }

            let live: Vec<&MessageEntry> = restored.messages.iter().collect();
            let log = journal
                .rewrite(&restored.queue, restored.options, &live)
                .await?;

            let mut inner = QueueInner {
                log: Some(log),
                ..QueueInner::default()
            };
            for entry in restored.messages {
                inner.ready.push_back(entry.id.clone());
                inner.entries.insert(entry.id.clone(), entry);
            }

            tracing::info!(
                "Restored queue {} with {} messages",
                restored.queue,
                inner.entries.len()
            );

            queues.insert(
                restored.queue.clone(),
                Arc::new(QueueState {
                    name: restored.queue,
                    options: restored.options,
                    inner: Mutex::new(inner),
                    notify: Notify::new(),
                }),
            );
        }

        Ok(Self {
            queues,
            consumers: DashMap::new(),
            journal: Some(journal),
            lease,
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Declares a queue. Re-declaring with the same options is a no-op.
    ///
    /// Names are limited to ASCII letters, digits, `_` and `-`.
    pub async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        validate_queue_name(queue)?;
        if let Some(existing) = self.queues.get(queue) {
            if existing.options.durable != options.durable {
                return Err(TransportError::QueueMismatch {
                    queue: queue.to_string(),
                    existing: existing.options.durable,
                });
            }
            return Ok(());
        }

        let state = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: queue.to_string(),
                    options,
                    inner: Mutex::new(QueueInner::default()),
                    notify: Notify::new(),
                })
            })
            .clone();

        tracing::info!("Declared queue {} (durable={})", queue, options.durable);

        let mut inner = state.inner.lock().await;
        if state.options.durable && inner.log.is_none() {
            if let Some(journal) = &self.journal {
                inner.log = Some(journal.rewrite(queue, state.options, &[]).await?);
            }
        }
        Ok(())
    }

    pub async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        let state = self.queue(queue)?;
        let id = MessageId::new();

        let mut inner = state.inner.lock().await;
        let entry = MessageEntry {
            id: id.clone(),
            body: message.body,
            properties: message.properties,
            status: MessageStatus::Ready,
            delivery_count: 0,
            published_at: now_ms(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        let record = entry.properties.persistent.then(|| JournalRecord::Publish {
            message: JournaledMessage::from(&entry),
        });
        inner.entries.insert(id.clone(), entry);
        inner.ready.push_back(id.clone());

        if let Some(record) = record {
            if let Err(e) = self.record(&state, &mut inner, record).await {
                inner.entries.remove(&id);
                inner.ready.retain(|queued| queued != &id);
                return Err(e);
            }
        }
        drop(inner);

        state.notify.notify_waiters();
        tracing::trace!("Published message {} to {}", id.0, queue);
        Ok(id)
    }

    /// Registers a consumer on `queue`. A prefetch of zero is treated as one.
    pub async fn consume(&self, queue: &str, prefetch: usize) -> Result<ConsumerTag, TransportError> {
        let state = self.queue(queue)?;
        let tag = ConsumerTag::new();

        state.inner.lock().await.consumers.insert(
            tag.clone(),
            ConsumerSlot {
                prefetch: prefetch.max(1),
                in_flight: HashSet::new(),
            },
        );
        self.consumers.insert(tag.clone(), queue.to_string());

        tracing::debug!("Consumer {} subscribed to {} (prefetch={})", tag.0, queue, prefetch.max(1));
        Ok(tag)
    }

    /// Hands the next ready message to `consumer`, waiting up to `wait` for one to appear.
    ///
    /// Returns `Ok(None)` on timeout or when the consumer already holds `prefetch`
    /// unacked messages for the whole wait.
    pub async fn fetch(
        &self,
        consumer: &ConsumerTag,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let state = self.queue_for(consumer)?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_fetch(&state, consumer).await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = (deadline - now).min(LEASE_SWEEP_INTERVAL);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn try_fetch(
        &self,
        state: &QueueState,
        consumer: &ConsumerTag,
    ) -> Result<Option<Delivery>, TransportError> {
        let mut inner = state.inner.lock().await;
        let now = now_ms();

        let reclaimed = reclaim_expired(&mut inner, now);
        if reclaimed > 0 {
            tracing::warn!(
                "Requeued {} messages with expired leases on {}",
                reclaimed,
                state.name
            );
        }

        let slot = inner
            .consumers
            .get(consumer)
            .ok_or_else(|| TransportError::ConsumerNotFound(consumer.0.clone()))?;
        if slot.in_flight.len() >= slot.prefetch {
            return Ok(None);
        }

        let Some(id) = inner.ready.pop_front() else {
            return Ok(None);
        };

        let lease_expires = now + self.lease.as_millis() as u64;
        let (delivery, persistent) = match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.status = MessageStatus::Unacked {
                    consumer: consumer.clone(),
                    lease_expires,
                };
                entry.delivery_count += 1;
                let delivery = Delivery {
                    delivery_tag: id.clone(),
                    queue: state.name.clone(),
                    body: entry.body.clone(),
                    properties: entry.properties.clone(),
                    redelivered: entry.delivery_count > 1,
                    delivery_count: entry.delivery_count,
                };
                (delivery, entry.properties.persistent)
            }
            None => return Ok(None),
        };

        if let Some(slot) = inner.consumers.get_mut(consumer) {
            slot.in_flight.insert(id.clone());
        }
        if persistent {
            self.record(state, &mut inner, JournalRecord::Deliver { id }).await?;
        }

        tracing::trace!(
            "Delivered {} from {} to {} (attempt {})",
            delivery.delivery_tag.0,
            state.name,
            consumer.0,
            delivery.delivery_count
        );
        Ok(Some(delivery))
    }

    /// Acknowledges a delivery, removing the message for good.
    pub async fn ack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
    ) -> Result<(), TransportError> {
        let state = self.queue_for(consumer)?;
        let mut inner = state.inner.lock().await;

        take_outstanding(&mut inner, consumer, delivery_tag)?;
        self.remove_entry(&state, &mut inner, delivery_tag).await?;
        drop(inner);

        state.notify.notify_waiters();
        Ok(())
    }

    /// Rejects a delivery. With `requeue` it goes back to the head of the queue, otherwise it is dropped.
    pub async fn nack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let state = self.queue_for(consumer)?;
        let mut inner = state.inner.lock().await;

        take_outstanding(&mut inner, consumer, delivery_tag)?;
        if requeue {
            if let Some(entry) = inner.entries.get_mut(delivery_tag) {
                entry.status = MessageStatus::Ready;
            }
            inner.ready.push_front(delivery_tag.clone());
        } else {
            self.remove_entry(&state, &mut inner, delivery_tag).await?;
            tracing::warn!("Discarded message {} from {}", delivery_tag.0, state.name);
        }
        drop(inner);

        state.notify.notify_waiters();
        Ok(())
    }

    /// Removes a consumer, requeueing everything it had not acknowledged.
    pub async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), TransportError> {
        let (_, queue) = self
            .consumers
            .remove(consumer)
            .ok_or_else(|| TransportError::ConsumerNotFound(consumer.0.clone()))?;
        let state = self.queue(&queue)?;
        let mut inner = state.inner.lock().await;

        let requeued = match inner.consumers.remove(consumer) {
            Some(slot) => {
                let mut outstanding: Vec<MessageEntry> = slot
                    .in_flight
                    .iter()
                    .filter_map(|id| inner.entries.get(id).cloned())
                    .collect();
                // Oldest first ends up at the head.
                outstanding.sort_by_key(|entry| std::cmp::Reverse(entry.sequence));
                for entry in &outstanding {
                    if let Some(stored) = inner.entries.get_mut(&entry.id) {
                        stored.status = MessageStatus::Ready;
                    }
                    inner.ready.push_front(entry.id.clone());
                }
                outstanding.len()
            }
            None => 0,
        };
        drop(inner);

        if requeued > 0 {
            tracing::info!(
                "Consumer {} cancelled, requeued {} unacked messages on {}",
                consumer.0,
                requeued,
                queue
            );
            state.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
        let state = self.queue(queue)?;
        let inner = state.inner.lock().await;
        let unacked = inner.entries.values().filter(|e| e.is_unacked()).count();

        Ok(QueueStats {
            ready: inner.entries.len() - unacked,
            unacked,
            consumers: inner.consumers.len(),
        })
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    fn queue(&self, queue: &str) -> Result<Arc<QueueState>, TransportError> {
        self.queues
            .get(queue)
            .map(|state| state.value().clone())
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))
    }

    fn queue_for(&self, consumer: &ConsumerTag) -> Result<Arc<QueueState>, TransportError> {
        let queue = self
            .consumers
            .get(consumer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConsumerNotFound(consumer.0.clone()))?;
        self.queue(&queue)
    }

    async fn remove_entry(
        &self,
        state: &QueueState,
        inner: &mut QueueInner,
        id: &MessageId,
    ) -> Result<(), TransportError> {
        match inner.entries.remove(id) {
            Some(entry) if entry.properties.persistent => {
                self.record(state, inner, JournalRecord::Remove { id: id.clone() })
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Appends `record` to the queue's log, compacting the log once it is mostly dead records.
    async fn record(
        &self,
        state: &QueueState,
        inner: &mut QueueInner,
        record: JournalRecord,
    ) -> Result<(), TransportError> {
        let Some(log) = inner.log.as_mut() else {
            return Ok(());
        };
        log.append(&record).await?;
        if !log.needs_compaction() {
            return Ok(());
        }
        let records = log.records();

        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut live: Vec<&MessageEntry> = inner
            .entries
            .values()
            .filter(|entry| entry.properties.persistent)
            .collect();
        live.sort_by_key(|entry| entry.sequence);

        let compacted = journal.rewrite(&state.name, state.options, &live).await?;
        tracing::debug!(
            "Compacted journal of {} from {} records to {} messages",
            state.name,
            records,
            live.len()
        );
        inner.log = Some(compacted);
        Ok(())
    }
}

/// Rejects names that are empty or contain anything besides ASCII letters, digits, `_` and `-`.
pub fn validate_queue_name(queue: &str) -> Result<(), TransportError> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidQueueName(queue.to_string()))
    }
}

/// Moves messages whose lease has lapsed back to the head of the ready list.
fn reclaim_expired(inner: &mut QueueInner, now: u64) -> usize {
    let mut expired: Vec<(MessageId, ConsumerTag, u64)> = inner
        .entries
        .values()
        .filter_map(|entry| match &entry.status {
            MessageStatus::Unacked {
                consumer,
                lease_expires,
            } if now > *lease_expires => {
                Some((entry.id.clone(), consumer.clone(), entry.sequence))
            }
            _ => None,
        })
        .collect();

    expired.sort_by_key(|(_, _, sequence)| std::cmp::Reverse(*sequence));
    for (id, consumer, _) in &expired {
        if let Some(slot) = inner.consumers.get_mut(consumer) {
            slot.in_flight.remove(id);
        }
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = MessageStatus::Ready;
        }
        inner.ready.push_front(id.clone());
    }

    expired.len()
}

/// Checks that `delivery_tag` is currently held by `consumer` and releases its prefetch slot.
fn take_outstanding(
    inner: &mut QueueInner,
    consumer: &ConsumerTag,
    delivery_tag: &MessageId,
) -> Result<(), TransportError> {
    let held = matches!(
        inner.entries.get(delivery_tag).map(|entry| &entry.status),
        Some(MessageStatus::Unacked { consumer: owner, .. }) if owner == consumer
    );

    let released = inner
        .consumers
        .get_mut(consumer)
        .map(|slot| slot.in_flight.remove(delivery_tag))
        .unwrap_or(false);

    if !held || !released {
        return Err(TransportError::UnknownDelivery {
            consumer: consumer.0.clone(),
            delivery_tag: delivery_tag.0.clone(),
        });
    }
    Ok(())
}
