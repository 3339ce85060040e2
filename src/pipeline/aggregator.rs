//! Merge Aggregator
//!
//! Sums partial counts into a running total. A partial count that carries the
//! sentinel ends the run: the total is cleaned up, published as the final
//! histogram and reset for the next run.
//!
//! ## States
//! - **Accumulating**: every partial count is added into the running total.
//! - **Finalizing**: transient, entered when the merged partial contains the sentinel.
//!   With unit ids, finalization waits until every unit before the sentinel was seen.

use super::types::{FinalHistogram, PartialCount};
use crate::broker::transport::{Consumer, Transport};
use crate::broker::types::{Delivery, MessageProperties, OutboundMessage, QueueOptions};
use crate::config::PipelineConfig;
use crate::error::TransportError;
use crate::segmenter::types::SENTINEL;

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// What merging one partial count did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Added to the running total; the run continues.
    Accumulated,
    /// The unit id was already merged in this run and was skipped.
    Duplicate,
    /// The payload was not a partial count and was dropped.
    Discarded,
    /// The partial carried the sentinel; the run is complete.
    Finalized(FinalHistogram),
}

/// Owns the running total of the current run.
///
/// Only one aggregator may consume a given partial-result queue.
#[derive(Debug, Default)]
pub struct MergeAggregator {
    running_total: BTreeMap<String, u64>,
    /// Unit ids merged or skipped in the current run.
    seen_units: HashSet<String>,
    /// Set once the sentinel of a tagged run arrived: its run id and how many units precede it.
    awaiting: Option<(String, usize)>,
}

impl MergeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_total(&self) -> &BTreeMap<String, u64> {
        &self.running_total
    }

    /// Adds `partial` into the running total and finalizes if it carries the sentinel.
    ///
    /// Not idempotent: merging the same partial twice counts it twice.
    pub fn merge(&mut self, partial: &PartialCount) -> MergeOutcome {
        self.add(partial);

        if partial.contains_sentinel() {
            MergeOutcome::Finalized(self.finalize())
        } else {
            MergeOutcome::Accumulated
        }
    }

    /// Like `merge`, but skips a unit id that was already seen in the current run.
    ///
    /// A sentinel tagged `<run_id>:<seq>` finalizes only once all `seq` units of
    /// its run were seen, so a sentinel that overtakes earlier partials waits for them.
    pub fn merge_unit(&mut self, unit_id: &str, partial: &PartialCount) -> MergeOutcome {
        if !self.seen_units.insert(unit_id.to_string()) {
            tracing::debug!("Skipping already merged unit {}", unit_id);
            return MergeOutcome::Duplicate;
        }
        self.add(partial);

        if partial.contains_sentinel() {
            match split_unit_id(unit_id) {
                Some((run_id, seq)) => self.awaiting = Some((run_id.to_string(), seq)),
                None => return MergeOutcome::Finalized(self.finalize()),
            }
        }
        self.finalize_if_complete()
            .unwrap_or(MergeOutcome::Accumulated)
    }

    /// Records a unit whose payload was unusable, so the run can still complete without it.
    pub fn skip_unit(&mut self, unit_id: &str) -> MergeOutcome {
        if !self.seen_units.insert(unit_id.to_string()) {
            return MergeOutcome::Duplicate;
        }
        self.finalize_if_complete()
            .unwrap_or(MergeOutcome::Discarded)
    }

    /// Snapshots the running total without the sentinel and the empty word, then resets.
    pub fn finalize(&mut self) -> FinalHistogram {
        let mut total = std::mem::take(&mut self.running_total);
        total.remove(SENTINEL);
        total.remove("");
        self.seen_units.clear();
        self.awaiting = None;
        FinalHistogram(total)
    }

    /// Drops the running total and the merged-unit record.
    pub fn reset(&mut self) {
        self.running_total.clear();
        self.seen_units.clear();
        self.awaiting = None;
    }

    fn add(&mut self, partial: &PartialCount) {
        for (word, count) in &partial.0 {
            *self.running_total.entry(word.clone()).or_insert(0) += count;
        }
    }

    fn finalize_if_complete(&mut self) -> Option<MergeOutcome> {
        let (run_id, expected) = self.awaiting.clone()?;

        let seen = self
            .seen_units
            .iter()
            .filter_map(|id| split_unit_id(id))
            .filter(|&(run, seq)| run == run_id && seq < expected)
            .count();
        if seen < expected {
            tracing::debug!(
                "Sentinel of run {} seen, waiting for {} more units",
                run_id,
                expected - seen
            );
            return None;
        }

        Some(MergeOutcome::Finalized(self.finalize()))
    }
}

fn split_unit_id(unit_id: &str) -> Option<(&str, usize)> {
    let (run_id, seq) = unit_id.rsplit_once(':')?;
    Some((run_id, seq.parse().ok()?))
}

/// The aggregator role: consumes the partial-result queue and publishes final histograms.
pub struct AggregatorService {
    transport: Arc<dyn Transport>,
    consumer: Consumer,
    response_queue: String,
    dedupe: bool,
    aggregator: MergeAggregator,
}

impl AggregatorService {
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: &PipelineConfig,
    ) -> Result<Self, TransportError> {
        transport
            .declare_queue(&config.queues.partial, QueueOptions::durable())
            .await?;
        transport
            .declare_queue(&config.queues.response, QueueOptions::durable())
            .await?;

        let consumer =
            Consumer::subscribe(transport.clone(), &config.queues.partial, 1, config.poll())
                .await?;

        Ok(Self {
            transport,
            consumer,
            response_queue: config.queues.response.clone(),
            dedupe: config.aggregator.dedupe_redeliveries,
            aggregator: MergeAggregator::new(),
        })
    }

    pub fn aggregator(&self) -> &MergeAggregator {
        &self.aggregator
    }

    /// Handles the next partial count. Malformed payloads are logged, acked and skipped.
    ///
    /// A final histogram is published before the partial that completed it is acked.
    pub async fn process_one(&mut self) -> Result<MergeOutcome, TransportError> {
        let delivery = self.consumer.recv().await?;

        let outcome = match PartialCount::from_bytes(&delivery.body) {
            Ok(partial) => self.merge_delivery(&delivery, &partial),
            Err(e) => {
                tracing::warn!(
                    "Discarding malformed partial count {}: {}",
                    delivery.delivery_tag.0,
                    e
                );
                self.skip_delivery(&delivery)
            }
        };

        if let MergeOutcome::Finalized(histogram) = &outcome {
            let body = histogram.to_pretty_json()?;
            let mut properties = MessageProperties::persistent("application/json");
            // The completing partial always belongs to the run that finished.
            let run_id = delivery
                .properties
                .unit_id
                .as_deref()
                .and_then(split_unit_id)
                .map(|(run_id, _)| run_id.to_string());
            if let Some(run_id) = &run_id {
                properties = properties.with_run_id(run_id.clone());
            }
            self.transport
                .publish(&self.response_queue, OutboundMessage::new(body, properties))
                .await?;
            tracing::info!(
                "Published final histogram of run {} ({} words, {} occurrences)",
                run_id.as_deref().unwrap_or("<untagged>"),
                histogram.len(),
                histogram.total_words()
            );
        }

        self.consumer.ack(&delivery).await?;
        Ok(outcome)
    }

    fn merge_delivery(&mut self, delivery: &Delivery, partial: &PartialCount) -> MergeOutcome {
        match (&delivery.properties.unit_id, self.dedupe) {
            (Some(unit_id), true) => self.aggregator.merge_unit(unit_id, partial),
            _ => self.aggregator.merge(partial),
        }
    }

    fn skip_delivery(&mut self, delivery: &Delivery) -> MergeOutcome {
        match (&delivery.properties.unit_id, self.dedupe) {
            (Some(unit_id), true) => self.aggregator.skip_unit(unit_id),
            _ => MergeOutcome::Discarded,
        }
    }

    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!("Aggregator consuming {}", self.consumer.queue());
        loop {
            self.process_one().await?;
        }
    }
}

/// Runs the aggregator role until a transport error occurs.
pub async fn run_aggregator(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Result<()> {
    let service = AggregatorService::connect(transport, config).await?;
    service.run().await?;
    Ok(())
}
