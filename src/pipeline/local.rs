//! All three roles in one process, sharing one transport.

use super::aggregator::run_aggregator;
use super::dispatcher::{DispatchReport, run_dispatcher};
use super::worker::run_worker_pool;
use crate::broker::transport::Transport;
use crate::config::PipelineConfig;

use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Starts the worker pool and the aggregator, then dispatches `location`.
///
/// The roles only stop when the run is over, so a role that returns first, with
/// or without an error, fails the run instead of leaving the dispatcher waiting.
pub async fn run_local(
    transport: Arc<dyn Transport>,
    config: &PipelineConfig,
    location: &str,
) -> Result<DispatchReport> {
    let mut roles = JoinSet::new();

    let worker_transport = transport.clone();
    let worker_config = config.clone();
    roles.spawn(async move {
        ("worker pool", run_worker_pool(worker_transport, &worker_config).await)
    });

    let aggregator_transport = transport.clone();
    let aggregator_config = config.clone();
    roles.spawn(async move {
        ("aggregator", run_aggregator(aggregator_transport, &aggregator_config).await)
    });

    let outcome = tokio::select! {
        report = run_dispatcher(transport, config, location) => report,
        Some(joined) = roles.join_next() => match joined {
            Ok((role, Ok(()))) => Err(anyhow!("{} exited before the run completed", role)),
            Ok((role, Err(e))) => Err(e.context(format!("{} stopped", role))),
            Err(join_error) => Err(anyhow!("pipeline role failed: {}", join_error)),
        },
    };

    roles.abort_all();
    outcome
}
