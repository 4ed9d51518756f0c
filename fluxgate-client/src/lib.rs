//! # FluxGate Client Library
//!
//! An async Rust client for applications talking to a FluxGate gateway. One
//! TCP connection carries many streams; each admin call, producer and offset
//! committer runs on its own stream and respects the credit the gateway
//! grants it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxgate_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = FluxgateClient::connect(ClientConfig::new("localhost:7114")).await?;
//!
//!     let retention = client
//!         .admin()
//!         .describe_configs("my-topic", &["retention.ms"])
//!         .await?;
//!     println!("retention: {:?}", retention);
//!
//!     let mut producer = client.producer("my-topic", 0).await?;
//!     let offset = producer
//!         .send(ProduceRecord::new("Hello FluxGate!").with_key("user-123"))
//!         .await?;
//!     println!("Message written at offset {}", offset);
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod committer;
pub mod config;
pub mod connection;
pub mod error;
pub mod producer;
pub mod stream;

pub use admin::{AdminClient, ClusterDescription};
pub use client::FluxgateClient;
pub use committer::OffsetCommitter;
pub use config::ClientConfig;
pub use error::FluxgateClientError;
pub use producer::{ProduceRecord, Producer};

/// Client library result type
pub type Result<T> = std::result::Result<T, FluxgateClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
