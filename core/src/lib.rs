//! # FluxGate Core Library
//!
//! FluxGate is a Kafka protocol gateway. Applications open lightweight
//! streams over a credit-based transport (Begin/Data/End/Abort/Flush/Window/
//! Reset/Signal frames) and the gateway maps them onto a small number of
//! flow-controlled Kafka broker connections.
//!
//! ## Architecture Overview
//!
//! - [`frame`] - transport frames, Kafka/proxy extensions and the frame codec
//! - [`protocol`] - Kafka wire codec, request/response messages, record batches
//! - [`flow`] - credit windows, half-stream state, shared budgets, slot pools
//! - [`engine`] - single-threaded shard dispatch, bindings, timers, routing
//! - [`client`] - incremental request/response clients (SASL, describe,
//!   delete/create topics, describe cluster, offsets, produce, fetch)
//! - [`fan`] - produce, fetch and consumer-group fans sharing one upstream
//! - [`pool`] - connection pool multiplexing request clients by correlation id
//! - [`cache`] - in-memory partition cache read through member cursors
//! - [`net`] - tokio runtime: workers, application listener, TCP bridge
//! - [`metrics`] - lock-free gateway counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxgate::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> fluxgate::Result<()> {
//!     let config = GatewayConfig::default().with_bootstrap(&["localhost:9092"]);
//!     let gateway = Gateway::new(config)?;
//!     gateway.run().await
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod fan;
pub mod flow;
pub mod frame;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod protocol;

pub use config::{GatewayConfig, SaslConfig};
pub use engine::{Engine, StreamFactory};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use net::Gateway;

use thiserror::Error;

/// FluxGate error types
///
/// Errors raised while a stream is being processed never escape the engine:
/// they turn into Reset and Abort frames on the streams involved. This enum
/// covers startup, configuration and the runtime around the engine.
#[derive(Debug, Error)]
pub enum FluxgateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka wire protocol codec errors
    #[error("Kafka codec error: {0}")]
    Codec(#[from] protocol::kafka::KafkaCodecError),

    /// Transport frame codec errors
    #[error("Frame error: {0}")]
    Frame(#[from] frame::FrameCodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Flow control violations
    #[error("Flow error: {0}")]
    Flow(#[from] flow::FlowError),
}

/// Result type alias for FluxGate operations
pub type Result<T> = std::result::Result<T, FluxgateError>;
