use super::protocol::*;
use super::queue::Broker;
use super::types::*;
use crate::error::TransportError;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Longest a single long-poll fetch is held open server-side.
const MAX_FETCH_WAIT: Duration = Duration::from_secs(30);

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_DECLARE, post(handle_declare))
        .route(ENDPOINT_PUBLISH, post(handle_publish))
        .route(ENDPOINT_CONSUME, post(handle_consume))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_FETCH, post(handle_fetch))
        .route(ENDPOINT_ACK, post(handle_ack))
        .route(ENDPOINT_NACK, post(handle_nack))
        .route(ENDPOINT_CANCEL, delete(handle_cancel))
        .layer(Extension(broker))
}

/// Serves the broker API until the process is stopped.
pub async fn serve(bind: SocketAddr, broker: Arc<Broker>) -> anyhow::Result<()> {
    let app = router(broker);

    tracing::info!("Broker listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn reject(err: TransportError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        TransportError::QueueNotFound(_)
        | TransportError::ConsumerNotFound(_)
        | TransportError::UnknownDelivery { .. } => StatusCode::NOT_FOUND,
        TransportError::InvalidQueueName(_) => StatusCode::BAD_REQUEST,
        TransportError::QueueMismatch { .. } => StatusCode::CONFLICT,
        TransportError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::warn!("Broker request failed: {}", err);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn handle_health(Extension(broker): Extension<Arc<Broker>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queues: broker.queue_names(),
    })
}

pub async fn handle_declare(
    Extension(broker): Extension<Arc<Broker>>,
    Path(name): Path<String>,
    Json(req): Json<DeclareQueueRequest>,
) -> ApiResult<OkResponse> {
    broker
        .declare_queue(&name, req.options)
        .await
        .map_err(reject)?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn handle_publish(
    Extension(broker): Extension<Arc<Broker>>,
    Path(name): Path<String>,
    Json(message): Json<OutboundMessage>,
) -> ApiResult<PublishResponse> {
    let message_id = broker.publish(&name, message).await.map_err(reject)?;
    Ok(Json(PublishResponse { message_id }))
}

pub async fn handle_consume(
    Extension(broker): Extension<Arc<Broker>>,
    Path(name): Path<String>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<ConsumeResponse> {
    let consumer_tag = broker.consume(&name, req.prefetch).await.map_err(reject)?;
    Ok(Json(ConsumeResponse { consumer_tag }))
}

pub async fn handle_stats(
    Extension(broker): Extension<Arc<Broker>>,
    Path(name): Path<String>,
) -> ApiResult<QueueStats> {
    let stats = broker.stats(&name).await.map_err(reject)?;
    Ok(Json(stats))
}

pub async fn handle_fetch(
    Extension(broker): Extension<Arc<Broker>>,
    Path(tag): Path<String>,
    Json(req): Json<FetchRequest>,
) -> ApiResult<FetchResponse> {
    let wait = Duration::from_millis(req.wait_ms).min(MAX_FETCH_WAIT);
    let delivery = broker
        .fetch(&ConsumerTag(tag), wait)
        .await
        .map_err(reject)?;
    Ok(Json(FetchResponse { delivery }))
}

pub async fn handle_ack(
    Extension(broker): Extension<Arc<Broker>>,
    Path(tag): Path<String>,
    Json(req): Json<AckRequest>,
) -> ApiResult<OkResponse> {
    broker
        .ack(&ConsumerTag(tag), &req.delivery_tag)
        .await
        .map_err(reject)?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn handle_nack(
    Extension(broker): Extension<Arc<Broker>>,
    Path(tag): Path<String>,
    Json(req): Json<NackRequest>,
) -> ApiResult<OkResponse> {
    broker
        .nack(&ConsumerTag(tag), &req.delivery_tag, req.requeue)
        .await
        .map_err(reject)?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn handle_cancel(
    Extension(broker): Extension<Arc<Broker>>,
    Path(tag): Path<String>,
) -> ApiResult<OkResponse> {
    broker.cancel(&ConsumerTag(tag)).await.map_err(reject)?;
    Ok(Json(OkResponse { success: true }))
}
