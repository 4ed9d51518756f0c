//! Admin operations, each carried by one short-lived gateway stream

use fluxgate::engine::CLIENT_BINDING;
use fluxgate::frame::{
    BeginEx, Frame, KafkaBeginEx, KafkaDataEx, KafkaOffset, KafkaRequestBeginEx,
    KafkaResponseBeginEx,
};
use fluxgate::protocol::kafka::{ClusterBroker, CreatableTopic, TopicError};
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::error::FluxgateClientError;
use crate::stream::ClientStream;

/// Cluster view returned by [`AdminClient::describe_cluster`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescription {
    pub cluster_id: String,
    pub controller_id: i32,
    pub brokers: Vec<ClusterBroker>,
}

/// Admin client for topic and offset management
pub struct AdminClient {
    connection: Arc<Connection>,
    timeout_ms: i32,
}

impl AdminClient {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            timeout_ms: 30_000,
        }
    }

    /// Broker side timeout sent with create and delete requests
    pub fn with_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Current values of `configs` for `topic`, unset ones as `None`
    pub async fn describe_configs(
        &self,
        topic: &str,
        configs: &[&str],
    ) -> Result<Vec<(String, Option<String>)>, FluxgateClientError> {
        let mut stream = self.open(KafkaBeginEx::Describe {
            topic: topic.to_string(),
            configs: configs.iter().map(|name| name.to_string()).collect(),
        })?;
        loop {
            if let Frame::Data(data) = next_reply(&mut stream).await? {
                if let Some(KafkaDataEx::Describe { configs }) = data.extension {
                    return Ok(configs);
                }
            }
        }
    }

    /// Creates topics, returning the per-topic outcome
    pub async fn create_topics(
        &self,
        topics: Vec<CreatableTopic>,
        validate_only: bool,
    ) -> Result<Vec<TopicError>, FluxgateClientError> {
        let request = KafkaRequestBeginEx::CreateTopics {
            topics,
            timeout_ms: self.timeout_ms,
            validate_only,
        };
        match self.request(request).await? {
            KafkaResponseBeginEx::CreateTopics { topics, .. } => Ok(topics),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes topics, returning the per-topic outcome
    pub async fn delete_topics(
        &self,
        names: &[&str],
    ) -> Result<Vec<TopicError>, FluxgateClientError> {
        let request = KafkaRequestBeginEx::DeleteTopics {
            names: names.iter().map(|name| name.to_string()).collect(),
            timeout_ms: self.timeout_ms,
        };
        match self.request(request).await? {
            KafkaResponseBeginEx::DeleteTopics { topics, .. } => Ok(topics),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn describe_cluster(&self) -> Result<ClusterDescription, FluxgateClientError> {
        let request = KafkaRequestBeginEx::DescribeCluster {
            include_authorized_operations: false,
        };
        match self.request(request).await? {
            KafkaResponseBeginEx::DescribeCluster {
                error_code,
                cluster_id,
                controller_id,
                brokers,
                ..
            } => {
                if error_code != 0 {
                    return Err(FluxgateClientError::rejected(error_code as i32));
                }
                Ok(ClusterDescription {
                    cluster_id,
                    controller_id,
                    brokers,
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Committed offsets of `group_id`; partitions without one are left out
    pub async fn offset_fetch(
        &self,
        group_id: &str,
        topic: &str,
        partitions: &[i32],
    ) -> Result<Vec<KafkaOffset>, FluxgateClientError> {
        let mut stream = self.open(KafkaBeginEx::OffsetFetch {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            partitions: partitions.to_vec(),
        })?;
        loop {
            if let Frame::Data(data) = next_reply(&mut stream).await? {
                if let Some(KafkaDataEx::OffsetFetch { partitions }) = data.extension {
                    return Ok(partitions);
                }
            }
        }
    }

    async fn request(
        &self,
        request: KafkaRequestBeginEx,
    ) -> Result<KafkaResponseBeginEx, FluxgateClientError> {
        let mut stream = self.open(KafkaBeginEx::Request(request))?;
        loop {
            if let Frame::Begin(begin) = next_reply(&mut stream).await? {
                if let BeginEx::Kafka(KafkaBeginEx::Response(response)) = begin.extension {
                    return Ok(response);
                }
            }
        }
    }

    fn open(&self, extension: KafkaBeginEx) -> Result<ClientStream, FluxgateClientError> {
        let stream = self.connection.open(CLIENT_BINDING, 0, extension)?;
        debug!("admin stream {} opened", stream.initial_id());
        Ok(stream)
    }
}

async fn next_reply(stream: &mut ClientStream) -> Result<Frame, FluxgateClientError> {
    match stream.recv().await? {
        Frame::End(_) => Err(FluxgateClientError::closed("reply ended without a result")),
        frame => Ok(frame),
    }
}

fn unexpected(response: &KafkaResponseBeginEx) -> FluxgateClientError {
    FluxgateClientError::protocol(format!("unexpected response {:?}", response))
}
