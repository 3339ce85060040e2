use super::types::{FinalHistogram, unit_id};
use crate::broker::transport::{Consumer, Transport};
use crate::broker::types::{Delivery, MessageProperties, OutboundMessage, QueueOptions};
use crate::config::{PipelineConfig, QueueNames};
use crate::error::{OutputError, TransportError};
use crate::ingestion::source::DocumentSource;
use crate::output::write_histogram;
use crate::segmenter::types::Segmentation;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Publishes the work units of one document and waits for its histogram.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    queues: QueueNames,
    poll: Duration,
    response_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Self {
        Self {
            transport,
            queues: config.queues.clone(),
            poll: config.poll(),
            response_timeout: config.response_timeout(),
        }
    }

    /// Runs one document through the pipeline.
    ///
    /// Every unit is published before the response queue is consumed. Responses
    /// tagged with another run id, such as the late histogram of a run that timed
    /// out, are acked and dropped. Without a response timeout the wait is unbounded.
    pub async fn dispatch(
        &self,
        segmentation: &Segmentation,
    ) -> Result<FinalHistogram, TransportError> {
        for queue in [&self.queues.task, &self.queues.response] {
            self.transport
                .declare_queue(queue, QueueOptions::durable())
                .await?;
        }

        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            "Dispatching run {} ({} units) to {}",
            run_id,
            segmentation.units.len(),
            self.queues.task
        );

        for (seq, unit) in segmentation.units.iter().enumerate() {
            let properties =
                MessageProperties::persistent("text/plain").with_unit_id(unit_id(&run_id, seq));
            self.transport
                .publish(
                    &self.queues.task,
                    OutboundMessage::new(unit.as_str().as_bytes(), properties),
                )
                .await?;
        }
        tracing::debug!("Run {} published, waiting on {}", run_id, self.queues.response);

        let consumer =
            Consumer::subscribe(self.transport.clone(), &self.queues.response, 1, self.poll)
                .await?;

        let received = self.await_response(&consumer, &run_id).await;
        let cancelled = consumer.cancel().await;
        let delivery = received?;
        cancelled?;

        let histogram = FinalHistogram::from_bytes(&delivery.body)?;
        tracing::info!(
            "Run {} complete: {} distinct words",
            run_id,
            histogram.len()
        );
        Ok(histogram)
    }

    async fn await_response(
        &self,
        consumer: &Consumer,
        run_id: &str,
    ) -> Result<Delivery, TransportError> {
        let deadline = self
            .response_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let delivery = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    consumer.recv_timeout(remaining).await?
                }
                None => consumer.recv().await?,
            };
            consumer.ack(&delivery).await?;

            if delivery.properties.run_id.as_deref() == Some(run_id) {
                return Ok(delivery);
            }
            tracing::warn!(
                "Dropping response of run {} while waiting for run {}",
                delivery.properties.run_id.as_deref().unwrap_or("<untagged>"),
                run_id
            );
        }
    }
}

/// What one dispatched document produced.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub title: String,
    pub units: usize,
    pub histogram: FinalHistogram,
    pub output_path: PathBuf,
    pub bytes_written: usize,
}

/// Loads `location`, runs it through the pipeline and writes the histogram file.
pub async fn run_dispatcher(
    transport: Arc<dyn Transport>,
    config: &PipelineConfig,
    location: &str,
) -> Result<DispatchReport> {
    let output_dir = &config.dispatcher.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| OutputError::Write {
            path: output_dir.clone(),
            source,
        })?;

    let document = DocumentSource::parse(location)
        .load(output_dir)
        .await
        .with_context(|| format!("Failed to load document {}", location))?;

    let segmentation = document.segment(config.dispatcher.delimiter_policy);
    tracing::info!(
        "Segmented \"{}\" into {} units",
        segmentation.title,
        segmentation.body_len()
    );

    let histogram = Dispatcher::new(transport, config)
        .dispatch(&segmentation)
        .await
        .context("Pipeline run failed")?;

    let (output_path, bytes_written) = write_histogram(
        output_dir,
        &segmentation.title,
        &histogram,
        config.dispatcher.format,
    )
    .await?;

    let units = segmentation.body_len();
    Ok(DispatchReport {
        title: segmentation.title,
        units,
        histogram,
        output_path,
        bytes_written,
    })
}
