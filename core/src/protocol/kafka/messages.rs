//! Kafka Request and Response Messages
//!
//! Requests are encoded whole into a `BytesMut`. Responses are decoded from a
//! [`WireReader`] either whole or one list element at a time, depending on how
//! the network clients step through them.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    put_bytes, put_compact_nullable_string, put_empty_tagged_fields, put_nullable_string,
    put_string, Result, WireReader,
};
use super::{has_flexible_response_header, KAFKA_FRAME_LENGTH_FIELD_OFFSET};

// ============================================================================
// Headers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn new(api_key: i16, api_version: i16, correlation_id: i32) -> Self {
        Self {
            api_key,
            api_version,
            correlation_id,
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        self.client_id = client_id.map(str::to_string);
        self
    }

    /// Writes `length` and the header, runs `body`, then back-fills `length`.
    pub fn encode_with<F>(&self, buf: &mut BytesMut, body: F)
    where
        F: FnOnce(&mut BytesMut),
    {
        let start = buf.len();
        buf.put_i32(0);
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        put_nullable_string(buf, self.client_id.as_deref());
        if self.api_key == super::API_KEY_DESCRIBE_CLUSTER {
            put_empty_tagged_fields(buf);
        }
        body(buf);
        let length = (buf.len() - start - KAFKA_FRAME_LENGTH_FIELD_OFFSET) as i32;
        buf[start..start + 4].copy_from_slice(&length.to_be_bytes());
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<(i32, Self)> {
        let length = r.i32()?;
        let api_key = r.i16()?;
        let api_version = r.i16()?;
        let correlation_id = r.i32()?;
        let client_id = r.nullable_string()?;
        Ok((
            length,
            Self {
                api_key,
                api_version,
                correlation_id,
                client_id,
            },
        ))
    }
}

/// Offset of the correlation id within an encoded request.
pub const REQUEST_CORRELATION_ID_OFFSET: usize = 8;

/// `length` then `correlation_id`.
pub const RESPONSE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub length: i32,
    pub correlation_id: i32,
}

impl ResponseHeader {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let length = r.i32()?;
        let correlation_id = r.i32()?;
        Ok(Self {
            length,
            correlation_id,
        })
    }

    /// Reads the header and, for flexible APIs, its tagged fields.
    pub fn decode_for(r: &mut WireReader<'_>, api_key: i16, api_version: i16) -> Result<Self> {
        let header = Self::decode(r)?;
        if has_flexible_response_header(api_key, api_version) {
            r.skip_tagged_fields()?;
        }
        Ok(header)
    }

    /// Total frame size including the length field.
    pub fn frame_size(&self) -> usize {
        KAFKA_FRAME_LENGTH_FIELD_OFFSET + self.length.max(0) as usize
    }

    /// Bytes of body following the header fields.
    pub fn body_size(&self) -> usize {
        self.frame_size().saturating_sub(RESPONSE_HEADER_SIZE)
    }
}

// ============================================================================
// SASL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.mechanism);
    }
}

/// Error code and mechanism count; the mechanisms follow one by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaslHandshakeResponse {
    pub error_code: i16,
    pub mechanism_count: usize,
}

impl SaslHandshakeResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let error_code = r.i16()?;
        let mechanism_count = r.array_len()?;
        Ok(Self {
            error_code,
            mechanism_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslAuthenticateRequest {
    pub auth_bytes: Bytes,
}

impl SaslAuthenticateRequest {
    /// PLAIN credentials: `\0username\0password`.
    pub fn plain(username: &str, password: &str) -> Self {
        let mut auth = BytesMut::with_capacity(username.len() + password.len() + 2);
        auth.put_u8(0);
        auth.put_slice(username.as_bytes());
        auth.put_u8(0);
        auth.put_slice(password.as_bytes());
        Self {
            auth_bytes: auth.freeze(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.auth_bytes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslAuthenticateResponse {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub auth_bytes: Bytes,
    pub session_lifetime_ms: i64,
}

impl SaslAuthenticateResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let error_code = r.i16()?;
        let error_message = r.nullable_string()?;
        let auth_bytes = r.nullable_bytes()?.unwrap_or_default();
        let session_lifetime_ms = r.i64()?;
        Ok(Self {
            error_code,
            error_message,
            auth_bytes,
            session_lifetime_ms,
        })
    }
}

// ============================================================================
// DescribeConfigs (v0)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsRequest {
    pub resource_type: i8,
    pub resource_name: String,
    pub config_names: Vec<String>,
}

impl DescribeConfigsRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(1);
        buf.put_i8(self.resource_type);
        put_string(buf, &self.resource_name);
        buf.put_i32(self.config_names.len() as i32);
        for name in &self.config_names {
            put_string(buf, name);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsEntry {
    pub name: String,
    pub value: Option<String>,
    pub read_only: bool,
    pub is_default: bool,
    pub is_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsResource {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub resource_type: i8,
    pub resource_name: String,
    pub configs: Vec<DescribeConfigsEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsResponse {
    pub throttle_time_ms: i32,
    pub resources: Vec<DescribeConfigsResource>,
}

impl DescribeConfigsResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let throttle_time_ms = r.i32()?;
        let resource_count = r.array_len()?;
        let mut resources = Vec::with_capacity(resource_count.min(16));
        for _ in 0..resource_count {
            let error_code = r.i16()?;
            let error_message = r.nullable_string()?;
            let resource_type = r.i8()?;
            let resource_name = r.string()?;
            let config_count = r.array_len()?;
            let mut configs = Vec::with_capacity(config_count.min(64));
            for _ in 0..config_count {
                configs.push(DescribeConfigsEntry {
                    name: r.string()?,
                    value: r.nullable_string()?,
                    read_only: r.bool()?,
                    is_default: r.bool()?,
                    is_sensitive: r.bool()?,
                });
            }
            resources.push(DescribeConfigsResource {
                error_code,
                error_message,
                resource_type,
                resource_name,
                configs,
            });
        }
        Ok(Self {
            throttle_time_ms,
            resources,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i32(self.resources.len() as i32);
        for resource in &self.resources {
            buf.put_i16(resource.error_code);
            put_nullable_string(buf, resource.error_message.as_deref());
            buf.put_i8(resource.resource_type);
            put_string(buf, &resource.resource_name);
            buf.put_i32(resource.configs.len() as i32);
            for config in &resource.configs {
                put_string(buf, &config.name);
                put_nullable_string(buf, config.value.as_deref());
                buf.put_i8(config.read_only as i8);
                buf.put_i8(config.is_default as i8);
                buf.put_i8(config.is_sensitive as i8);
            }
        }
    }
}

// ============================================================================
// DeleteTopics (v3) and CreateTopics (v3)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTopicsRequest {
    pub names: Vec<String>,
    pub timeout_ms: i32,
}

impl DeleteTopicsRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.names.len() as i32);
        for name in &self.names {
            put_string(buf, name);
        }
        buf.put_i32(self.timeout_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicError {
    pub name: String,
    pub error_code: i16,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTopicsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<TopicError>,
}

impl DeleteTopicsResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let throttle_time_ms = r.i32()?;
        let count = r.array_len()?;
        let mut topics = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            topics.push(TopicError {
                name: r.string()?,
                error_code: r.i16()?,
                error_message: None,
            });
        }
        Ok(Self {
            throttle_time_ms,
            topics,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(buf, &topic.name);
            buf.put_i16(topic.error_code);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatableTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    pub configs: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTopicsRequest {
    pub topics: Vec<CreatableTopic>,
    pub timeout_ms: i32,
    pub validate_only: bool,
}

impl CreateTopicsRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(buf, &topic.name);
            buf.put_i32(topic.num_partitions);
            buf.put_i16(topic.replication_factor);
            // no manual assignments
            buf.put_i32(0);
            buf.put_i32(topic.configs.len() as i32);
            for (name, value) in &topic.configs {
                put_string(buf, name);
                put_nullable_string(buf, value.as_deref());
            }
        }
        buf.put_i32(self.timeout_ms);
        buf.put_i8(self.validate_only as i8);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTopicsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<TopicError>,
}

impl CreateTopicsResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let throttle_time_ms = r.i32()?;
        let count = r.array_len()?;
        let mut topics = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            topics.push(TopicError {
                name: r.string()?,
                error_code: r.i16()?,
                error_message: r.nullable_string()?,
            });
        }
        Ok(Self {
            throttle_time_ms,
            topics,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(buf, &topic.name);
            buf.put_i16(topic.error_code);
            put_nullable_string(buf, topic.error_message.as_deref());
        }
    }
}

// ============================================================================
// DescribeCluster (v0, flexible)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescribeClusterRequest {
    pub include_cluster_authorized_operations: bool,
}

impl DescribeClusterRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i8(self.include_cluster_authorized_operations as i8);
        put_empty_tagged_fields(buf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBroker {
    pub broker_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeClusterResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub cluster_id: String,
    pub controller_id: i32,
    pub brokers: Vec<ClusterBroker>,
    pub cluster_authorized_operations: i32,
}

impl DescribeClusterResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let throttle_time_ms = r.i32()?;
        let error_code = r.i16()?;
        let error_message = r.compact_nullable_string()?;
        let cluster_id = r.compact_string()?;
        let controller_id = r.i32()?;
        let count = r.compact_array_len()?;
        let mut brokers = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let broker_id = r.i32()?;
            let host = r.compact_string()?;
            let port = r.i32()?;
            let rack = r.compact_nullable_string()?;
            r.skip_tagged_fields()?;
            brokers.push(ClusterBroker {
                broker_id,
                host,
                port,
                rack,
            });
        }
        let cluster_authorized_operations = r.i32()?;
        r.skip_tagged_fields()?;
        Ok(Self {
            throttle_time_ms,
            error_code,
            error_message,
            cluster_id,
            controller_id,
            brokers,
            cluster_authorized_operations,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        use super::codec::{put_compact_array_len, put_compact_string};

        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
        put_compact_nullable_string(buf, self.error_message.as_deref());
        put_compact_string(buf, &self.cluster_id);
        buf.put_i32(self.controller_id);
        put_compact_array_len(buf, self.brokers.len());
        for broker in &self.brokers {
            buf.put_i32(broker.broker_id);
            put_compact_string(buf, &broker.host);
            buf.put_i32(broker.port);
            put_compact_nullable_string(buf, broker.rack.as_deref());
            put_empty_tagged_fields(buf);
        }
        buf.put_i32(self.cluster_authorized_operations);
        put_empty_tagged_fields(buf);
    }
}

// ============================================================================
// OffsetCommit (v7)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub topic: String,
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_leader_epoch: i32,
    pub committed_metadata: Option<String>,
}

impl OffsetCommitRequest {
    /// One topic with one partition per request.
    pub fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.group_id);
        buf.put_i32(self.generation_id);
        put_string(buf, &self.member_id);
        put_nullable_string(buf, self.group_instance_id.as_deref());
        buf.put_i32(1);
        put_string(buf, &self.topic);
        buf.put_i32(1);
        buf.put_i32(self.partition_index);
        buf.put_i64(self.committed_offset);
        buf.put_i32(self.committed_leader_epoch);
        put_nullable_string(buf, self.committed_metadata.as_deref());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topic_count: usize,
}

impl OffsetCommitResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: r.i32()?,
            topic_count: r.array_len()?,
        })
    }
}

/// Topic name and partition count, shared by the commit and fetch responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicResponseHeader {
    pub name: String,
    pub partition_count: usize,
}

impl TopicResponseHeader {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.string()?,
            partition_count: r.array_len()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCommitPartitionResponse {
    pub partition_index: i32,
    pub error_code: i16,
}

impl OffsetCommitPartitionResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            partition_index: r.i32()?,
            error_code: r.i16()?,
        })
    }
}

// ============================================================================
// OffsetFetch (v0)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topic: String,
    pub partitions: Vec<i32>,
}

impl OffsetFetchRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.group_id);
        buf.put_i32(1);
        put_string(buf, &self.topic);
        buf.put_i32(self.partitions.len() as i32);
        for partition in &self.partitions {
            buf.put_i32(*partition);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    pub topic_count: usize,
}

impl OffsetFetchResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            topic_count: r.array_len()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchPartitionResponse {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub metadata: Option<String>,
    pub error_code: i16,
}

impl OffsetFetchPartitionResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            partition_index: r.i32()?,
            committed_offset: r.i64()?,
            metadata: r.nullable_string()?,
            error_code: r.i16()?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.partition_index);
        buf.put_i64(self.committed_offset);
        put_nullable_string(buf, self.metadata.as_deref());
        buf.put_i16(self.error_code);
    }
}

// ============================================================================
// Produce (v3)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topic: String,
    pub partition: i32,
    pub records: Bytes,
}

impl ProduceRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_nullable_string(buf, self.transactional_id.as_deref());
        buf.put_i16(self.acks);
        buf.put_i32(self.timeout_ms);
        buf.put_i32(1);
        put_string(buf, &self.topic);
        buf.put_i32(1);
        buf.put_i32(self.partition);
        put_bytes(buf, &self.records);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

impl ProduceResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let topic_count = r.array_len()?;
        let mut topics = Vec::with_capacity(topic_count.min(16));
        for _ in 0..topic_count {
            let name = r.string()?;
            let partition_count = r.array_len()?;
            let mut partitions = Vec::with_capacity(partition_count.min(64));
            for _ in 0..partition_count {
                partitions.push(ProducePartitionResponse {
                    partition: r.i32()?,
                    error_code: r.i16()?,
                    base_offset: r.i64()?,
                    log_append_time_ms: r.i64()?,
                });
            }
            topics.push(ProduceTopicResponse { name, partitions });
        }
        let throttle_time_ms = r.i32()?;
        Ok(Self {
            topics,
            throttle_time_ms,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(buf, &topic.name);
            buf.put_i32(topic.partitions.len() as i32);
            for partition in &topic.partitions {
                buf.put_i32(partition.partition);
                buf.put_i16(partition.error_code);
                buf.put_i64(partition.base_offset);
                buf.put_i64(partition.log_append_time_ms);
            }
        }
        buf.put_i32(self.throttle_time_ms);
    }
}

// ============================================================================
// Fetch (v5)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    pub topic: String,
    pub partition: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        // consumer, not a follower replica
        buf.put_i32(-1);
        buf.put_i32(self.max_wait_ms);
        buf.put_i32(self.min_bytes);
        buf.put_i32(self.max_bytes);
        buf.put_i8(self.isolation_level);
        buf.put_i32(1);
        put_string(buf, &self.topic);
        buf.put_i32(1);
        buf.put_i32(self.partition);
        buf.put_i64(self.fetch_offset);
        buf.put_i64(self.log_start_offset);
        buf.put_i32(self.partition_max_bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub topic_count: usize,
}

impl FetchResponse {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: r.i32()?,
            topic_count: r.array_len()?,
        })
    }
}

/// Partition fields up to and including the record set length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPartitionHeader {
    pub partition_index: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    pub records_size: usize,
}

impl FetchPartitionHeader {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let partition_index = r.i32()?;
        let error_code = r.i16()?;
        let high_watermark = r.i64()?;
        let last_stable_offset = r.i64()?;
        let log_start_offset = r.i64()?;
        let aborted = r.i32()?;
        for _ in 0..aborted.max(0) {
            let _producer_id = r.i64()?;
            let _first_offset = r.i64()?;
        }
        let records_size = r.i32()?.max(0) as usize;
        Ok(Self {
            partition_index,
            error_code,
            high_watermark,
            last_stable_offset,
            log_start_offset,
            records_size,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.partition_index);
        buf.put_i16(self.error_code);
        buf.put_i64(self.high_watermark);
        buf.put_i64(self.last_stable_offset);
        buf.put_i64(self.log_start_offset);
        buf.put_i32(-1);
        buf.put_i32(self.records_size as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::kafka::{
        partial, API_KEY_DESCRIBE_CONFIGS, API_VERSION_DESCRIBE_CONFIGS, RESOURCE_TYPE_TOPIC,
    };

    #[test]
    fn test_request_header_length_backfill() {
        let header = RequestHeader::new(API_KEY_DESCRIBE_CONFIGS, API_VERSION_DESCRIBE_CONFIGS, 7)
            .with_client_id(Some("fluxgate"));
        let request = DescribeConfigsRequest {
            resource_type: RESOURCE_TYPE_TOPIC,
            resource_name: "events".to_string(),
            config_names: vec!["retention.ms".to_string()],
        };

        let mut buf = BytesMut::new();
        header.encode_with(&mut buf, |b| request.encode(b));

        let mut r = WireReader::new(&buf);
        let (length, decoded) = RequestHeader::decode(&mut r).unwrap();
        assert_eq!(length as usize, buf.len() - 4);
        assert_eq!(decoded, header);
        assert_eq!(r.i32().unwrap(), 1);
        assert_eq!(r.i8().unwrap(), RESOURCE_TYPE_TOPIC);
        assert_eq!(r.string().unwrap(), "events");
    }

    #[test]
    fn test_sasl_plain_bytes() {
        let request = SaslAuthenticateRequest::plain("user", "secret");
        assert_eq!(&request.auth_bytes[..], b"\0user\0secret");
    }

    #[test]
    fn test_describe_configs_response() {
        let response = DescribeConfigsResponse {
            throttle_time_ms: 0,
            resources: vec![DescribeConfigsResource {
                error_code: 0,
                error_message: None,
                resource_type: RESOURCE_TYPE_TOPIC,
                resource_name: "events".to_string(),
                configs: vec![DescribeConfigsEntry {
                    name: "retention.ms".to_string(),
                    value: Some("604800000".to_string()),
                    read_only: false,
                    is_default: true,
                    is_sensitive: false,
                }],
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);

        let decoded = DescribeConfigsResponse::decode(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(decoded, response);

        let truncated = &buf[..buf.len() - 1];
        let result = partial(DescribeConfigsResponse::decode(&mut WireReader::new(truncated)));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_describe_cluster_response() {
        let response = DescribeClusterResponse {
            throttle_time_ms: 0,
            error_code: 0,
            error_message: None,
            cluster_id: "cluster-1".to_string(),
            controller_id: 1,
            brokers: vec![ClusterBroker {
                broker_id: 1,
                host: "broker-1".to_string(),
                port: 9092,
                rack: None,
            }],
            cluster_authorized_operations: i32::MIN,
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        let decoded = DescribeClusterResponse::decode(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_fetch_partition_header_skips_aborted() {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i16(0);
        buf.put_i64(100);
        buf.put_i64(100);
        buf.put_i64(0);
        buf.put_i32(1);
        buf.put_i64(42);
        buf.put_i64(10);
        buf.put_i32(128);

        let header = FetchPartitionHeader::decode(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(header.high_watermark, 100);
        assert_eq!(header.records_size, 128);
    }
}
