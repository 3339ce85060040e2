//! HTTP client for a remote broker.
//!
//! Each call is a single JSON request. Connection-level failures are retried a few
//! times with exponential backoff and jitter; anything the broker answers with a
//! non-success status is returned as [`TransportError::Rejected`] without retrying.

use super::protocol::*;
use super::transport::Transport;
use super::types::*;
use crate::error::TransportError;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: usize = 3;

pub struct HttpTransport {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Checks that the broker answers on `/health`.
    pub async fn health(&self) -> Result<HealthResponse, TransportError> {
        let url = format!("{}{}", self.base_url, ENDPOINT_HEALTH);
        let response = self
            .send_with_retry(|| self.http_client.get(&url), REQUEST_TIMEOUT)
            .await?;
        decode(response).await
    }

    async fn post_json<T, R>(
        &self,
        path: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        T: serde::Serialize,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .send_with_retry(|| self.http_client.post(&url).json(payload), timeout)
            .await?;
        decode(response).await
    }

    async fn send_with_retry<F>(
        &self,
        build: F,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            match build().timeout(timeout).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 >= RETRY_ATTEMPTS => return Err(TransportError::Http(e)),
                Err(e) => {
                    attempt += 1;
                    tracing::debug!("Broker request failed (attempt {}): {}", attempt, e);
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response.json::<R>().await?)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        let _: OkResponse = self
            .post_json(
                &queue_path(queue, "declare")?,
                &DeclareQueueRequest { options },
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        let response: PublishResponse = self
            .post_json(&queue_path(queue, "publish")?, &message, REQUEST_TIMEOUT)
            .await?;
        Ok(response.message_id)
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<ConsumerTag, TransportError> {
        let response: ConsumeResponse = self
            .post_json(
                &queue_path(queue, "consume")?,
                &ConsumeRequest { prefetch },
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(response.consumer_tag)
    }

    async fn fetch(
        &self,
        consumer: &ConsumerTag,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let response: FetchResponse = self
            .post_json(
                &consumer_path(consumer, Some("fetch"))?,
                &FetchRequest {
                    wait_ms: wait.as_millis() as u64,
                },
                wait + REQUEST_TIMEOUT,
            )
            .await?;
        Ok(response.delivery)
    }

    async fn ack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
    ) -> Result<(), TransportError> {
        let _: OkResponse = self
            .post_json(
                &consumer_path(consumer, Some("ack"))?,
                &AckRequest {
                    delivery_tag: delivery_tag.clone(),
                },
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        consumer: &ConsumerTag,
        delivery_tag: &MessageId,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let _: OkResponse = self
            .post_json(
                &consumer_path(consumer, Some("nack"))?,
                &NackRequest {
                    delivery_tag: delivery_tag.clone(),
                    requeue,
                },
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, consumer_path(consumer, None)?);
        let response = self
            .send_with_retry(|| self.http_client.delete(&url), REQUEST_TIMEOUT)
            .await?;
        let _: OkResponse = decode(response).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
        let url = format!("{}{}", self.base_url, queue_path(queue, "stats")?);
        let response = self
            .send_with_retry(|| self.http_client.get(&url), REQUEST_TIMEOUT)
            .await?;
        decode(response).await
    }
}
