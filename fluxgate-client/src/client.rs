//! High-level client interface

use std::sync::Arc;

use crate::admin::AdminClient;
use crate::committer::OffsetCommitter;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::FluxgateClientError;
use crate::producer::Producer;

/// Main client for FluxGate operations
#[derive(Clone)]
pub struct FluxgateClient {
    connection: Arc<Connection>,
}

impl FluxgateClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, FluxgateClientError> {
        let connection = Connection::connect(config).await?;
        Ok(Self { connection })
    }

    /// Connects to a gateway on localhost with default settings
    pub async fn localhost() -> Result<Self, FluxgateClientError> {
        Self::connect(ClientConfig::default()).await
    }

    pub fn admin(&self) -> AdminClient {
        AdminClient::new(Arc::clone(&self.connection))
    }

    pub async fn producer(
        &self,
        topic: &str,
        partition_id: i32,
    ) -> Result<Producer, FluxgateClientError> {
        Producer::open(&self.connection, topic, partition_id).await
    }

    pub fn committer(
        &self,
        group_id: &str,
        member_id: &str,
        instance_id: Option<&str>,
    ) -> Result<OffsetCommitter, FluxgateClientError> {
        OffsetCommitter::open(&self.connection, group_id, member_id, instance_id)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_healthy()
    }
}
