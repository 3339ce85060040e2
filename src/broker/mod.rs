//! Message Broker Module
//!
//! The queue transport the pipeline runs on. It offers the guarantees the
//! counting protocol relies on:
//!
//! 1. **Named, durable queues**: declared up front by every role; durable queues are
//!    journaled to disk when the broker has a data dir.
//! 2. **Manual acknowledgement**: a delivery stays outstanding until acked. Nacked
//!    deliveries, deliveries of cancelled consumers and deliveries whose lease
//!    expired are handed out again (at-least-once).
//! 3. **Prefetch**: a consumer never holds more than `prefetch` unacked deliveries,
//!    which gives natural backpressure.
//!
//! ## Submodules
//! - **`queue`**: The in-process `Broker` holding all queue state.
//! - **`transport`**: The `Transport` trait the pipeline is written against, plus the `Consumer` receive loop.
//! - **`client`**: `HttpTransport`, the same trait over HTTP for multi-process deployments.
//! - **`handlers`**: Axum handlers exposing a `Broker` over HTTP.
//! - **`protocol`**: Endpoint constants and DTOs shared by client and server.
//! - **`journal`**: Append-only record logs backing durable queues.

pub mod client;
pub mod handlers;
pub mod journal;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod types;
