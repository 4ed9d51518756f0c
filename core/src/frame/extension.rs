//! Kafka and proxy frame extensions.
//!
//! Every extension starts with a one byte kind discriminator followed by the
//! kind specific fields, encoded with the same primitives as the Kafka wire
//! protocol.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::kafka::codec::{
    put_bytes, put_nullable_bytes, put_nullable_string, put_string, Result, WireReader,
};
use crate::protocol::kafka::{ClusterBroker, CreatableTopic, TopicError};

/// Partition id with an offset position and the known end of the log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaOffset {
    pub partition_id: i32,
    pub partition_offset: i64,
    pub latest_offset: i64,
    pub metadata: Option<String>,
}

impl KafkaOffset {
    pub fn new(partition_id: i32, partition_offset: i64) -> Self {
        Self {
            partition_id,
            partition_offset,
            latest_offset: partition_offset,
            metadata: None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.partition_id);
        buf.put_i64(self.partition_offset);
        buf.put_i64(self.latest_offset);
        put_nullable_string(buf, self.metadata.as_deref());
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            partition_id: r.i32()?,
            partition_offset: r.i64()?,
            latest_offset: r.i64()?,
            metadata: r.nullable_string()?,
        })
    }
}

pub type KafkaHeader = (String, Option<Bytes>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub id: String,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartitions {
    pub topic: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerAssignment {
    pub consumer_id: String,
    pub partitions: Vec<TopicPartitions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaRequestBeginEx {
    CreateTopics {
        topics: Vec<CreatableTopic>,
        timeout_ms: i32,
        validate_only: bool,
    },
    DeleteTopics {
        names: Vec<String>,
        timeout_ms: i32,
    },
    DescribeCluster {
        include_authorized_operations: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaResponseBeginEx {
    CreateTopics {
        throttle_time_ms: i32,
        topics: Vec<TopicError>,
    },
    DeleteTopics {
        throttle_time_ms: i32,
        topics: Vec<TopicError>,
    },
    DescribeCluster {
        throttle_time_ms: i32,
        error_code: i16,
        cluster_id: String,
        controller_id: i32,
        brokers: Vec<ClusterBroker>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaBeginEx {
    Consumer {
        group_id: String,
        consumer_id: String,
        timeout_ms: i32,
        topic: String,
        partition_ids: Vec<i32>,
    },
    Produce {
        transaction: Option<String>,
        topic: String,
        partition: KafkaOffset,
    },
    Fetch {
        topic: String,
        partition: KafkaOffset,
    },
    Describe {
        topic: String,
        configs: Vec<String>,
    },
    Request(KafkaRequestBeginEx),
    Response(KafkaResponseBeginEx),
    OffsetCommit {
        group_id: String,
        member_id: String,
        instance_id: Option<String>,
    },
    OffsetFetch {
        group_id: String,
        topic: String,
        partitions: Vec<i32>,
    },
    Group {
        group_id: String,
        protocol: String,
        timeout_ms: i32,
        instance_id: Option<String>,
        metadata: Bytes,
    },
}

/// Routing discriminator of a Kafka begin extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KafkaKind {
    Consumer,
    Produce,
    Fetch,
    Describe,
    Request,
    Response,
    OffsetCommit,
    OffsetFetch,
    Group,
}

impl KafkaBeginEx {
    pub fn kind(&self) -> KafkaKind {
        match self {
            KafkaBeginEx::Consumer { .. } => KafkaKind::Consumer,
            KafkaBeginEx::Produce { .. } => KafkaKind::Produce,
            KafkaBeginEx::Fetch { .. } => KafkaKind::Fetch,
            KafkaBeginEx::Describe { .. } => KafkaKind::Describe,
            KafkaBeginEx::Request(_) => KafkaKind::Request,
            KafkaBeginEx::Response(_) => KafkaKind::Response,
            KafkaBeginEx::OffsetCommit { .. } => KafkaKind::OffsetCommit,
            KafkaBeginEx::OffsetFetch { .. } => KafkaKind::OffsetFetch,
            KafkaBeginEx::Group { .. } => KafkaKind::Group,
        }
    }

    /// Topic the stream is bound to, when it has one.
    pub fn topic(&self) -> Option<&str> {
        match self {
            KafkaBeginEx::Consumer { topic, .. }
            | KafkaBeginEx::Produce { topic, .. }
            | KafkaBeginEx::Fetch { topic, .. }
            | KafkaBeginEx::Describe { topic, .. }
            | KafkaBeginEx::OffsetFetch { topic, .. } => Some(topic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaDataEx {
    Produce {
        deferred: i32,
        timestamp: i64,
        key: Option<Bytes>,
        headers: Vec<KafkaHeader>,
    },
    Fetch {
        deferred: i32,
        timestamp: i64,
        partition: KafkaOffset,
        key: Option<Bytes>,
        headers: Vec<KafkaHeader>,
    },
    Describe {
        configs: Vec<(String, Option<String>)>,
    },
    OffsetCommit {
        topic: String,
        partition: KafkaOffset,
        generation_id: i32,
        leader_epoch: i32,
    },
    OffsetFetch {
        partitions: Vec<KafkaOffset>,
    },
    Consumer {
        partitions: Vec<i32>,
        assignments: Vec<ConsumerAssignment>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaFlushEx {
    Produce {
        partition: KafkaOffset,
        error: i32,
    },
    Fetch {
        partition: KafkaOffset,
    },
    Group {
        leader_id: String,
        member_id: String,
        members: Vec<GroupMember>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KafkaResetEx {
    pub error: i32,
}

impl KafkaResetEx {
    pub fn new(error: i32) -> Self {
        Self { error }
    }
}

/// Network address a client stream should be connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyBeginEx {
    pub host: String,
    pub port: u16,
}

impl ProxyBeginEx {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid_kind(what: &str, kind: u8) -> crate::protocol::kafka::KafkaCodecError {
    crate::protocol::kafka::KafkaCodecError::invalid(format!("Unknown {} kind {}", what, kind))
}

fn put_strings(buf: &mut BytesMut, values: &[String]) {
    buf.put_i32(values.len() as i32);
    for value in values {
        put_string(buf, value);
    }
}

fn read_strings(r: &mut WireReader<'_>) -> Result<Vec<String>> {
    let count = r.array_len()?;
    (0..count).map(|_| r.string()).collect()
}

fn put_i32s(buf: &mut BytesMut, values: &[i32]) {
    buf.put_i32(values.len() as i32);
    for value in values {
        buf.put_i32(*value);
    }
}

fn read_i32s(r: &mut WireReader<'_>) -> Result<Vec<i32>> {
    let count = r.array_len()?;
    (0..count).map(|_| r.i32()).collect()
}

fn put_headers(buf: &mut BytesMut, headers: &[KafkaHeader]) {
    buf.put_i32(headers.len() as i32);
    for (name, value) in headers {
        put_string(buf, name);
        put_nullable_bytes(buf, value.as_deref());
    }
}

fn read_headers(r: &mut WireReader<'_>) -> Result<Vec<KafkaHeader>> {
    let count = r.array_len()?;
    (0..count)
        .map(|_| Ok((r.string()?, r.nullable_bytes()?)))
        .collect()
}

fn put_topic_errors(buf: &mut BytesMut, topics: &[TopicError]) {
    buf.put_i32(topics.len() as i32);
    for topic in topics {
        put_string(buf, &topic.name);
        buf.put_i16(topic.error_code);
        put_nullable_string(buf, topic.error_message.as_deref());
    }
}

fn read_topic_errors(r: &mut WireReader<'_>) -> Result<Vec<TopicError>> {
    let count = r.array_len()?;
    (0..count)
        .map(|_| {
            Ok(TopicError {
                name: r.string()?,
                error_code: r.i16()?,
                error_message: r.nullable_string()?,
            })
        })
        .collect()
}

impl KafkaRequestBeginEx {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            KafkaRequestBeginEx::CreateTopics {
                topics,
                timeout_ms,
                validate_only,
            } => {
                buf.put_u8(0);
                buf.put_i32(topics.len() as i32);
                for topic in topics {
                    put_string(buf, &topic.name);
                    buf.put_i32(topic.num_partitions);
                    buf.put_i16(topic.replication_factor);
                    buf.put_i32(topic.configs.len() as i32);
                    for (name, value) in &topic.configs {
                        put_string(buf, name);
                        put_nullable_string(buf, value.as_deref());
                    }
                }
                buf.put_i32(*timeout_ms);
                buf.put_i8(*validate_only as i8);
            }
            KafkaRequestBeginEx::DeleteTopics { names, timeout_ms } => {
                buf.put_u8(1);
                put_strings(buf, names);
                buf.put_i32(*timeout_ms);
            }
            KafkaRequestBeginEx::DescribeCluster {
                include_authorized_operations,
            } => {
                buf.put_u8(2);
                buf.put_i8(*include_authorized_operations as i8);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.i8()? as u8 {
            0 => {
                let count = r.array_len()?;
                let mut topics = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let name = r.string()?;
                    let num_partitions = r.i32()?;
                    let replication_factor = r.i16()?;
                    let config_count = r.array_len()?;
                    let configs = (0..config_count)
                        .map(|_| Ok((r.string()?, r.nullable_string()?)))
                        .collect::<Result<Vec<_>>>()?;
                    topics.push(CreatableTopic {
                        name,
                        num_partitions,
                        replication_factor,
                        configs,
                    });
                }
                Ok(KafkaRequestBeginEx::CreateTopics {
                    topics,
                    timeout_ms: r.i32()?,
                    validate_only: r.bool()?,
                })
            }
            1 => Ok(KafkaRequestBeginEx::DeleteTopics {
                names: read_strings(r)?,
                timeout_ms: r.i32()?,
            }),
            2 => Ok(KafkaRequestBeginEx::DescribeCluster {
                include_authorized_operations: r.bool()?,
            }),
            kind => Err(invalid_kind("request", kind)),
        }
    }
}

impl KafkaResponseBeginEx {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            KafkaResponseBeginEx::CreateTopics {
                throttle_time_ms,
                topics,
            } => {
                buf.put_u8(0);
                buf.put_i32(*throttle_time_ms);
                put_topic_errors(buf, topics);
            }
            KafkaResponseBeginEx::DeleteTopics {
                throttle_time_ms,
                topics,
            } => {
                buf.put_u8(1);
                buf.put_i32(*throttle_time_ms);
                put_topic_errors(buf, topics);
            }
            KafkaResponseBeginEx::DescribeCluster {
                throttle_time_ms,
                error_code,
                cluster_id,
                controller_id,
                brokers,
            } => {
                buf.put_u8(2);
                buf.put_i32(*throttle_time_ms);
                buf.put_i16(*error_code);
                put_string(buf, cluster_id);
                buf.put_i32(*controller_id);
                buf.put_i32(brokers.len() as i32);
                for broker in brokers {
                    buf.put_i32(broker.broker_id);
                    put_string(buf, &broker.host);
                    buf.put_i32(broker.port);
                    put_nullable_string(buf, broker.rack.as_deref());
                }
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.i8()? as u8 {
            0 => Ok(KafkaResponseBeginEx::CreateTopics {
                throttle_time_ms: r.i32()?,
                topics: read_topic_errors(r)?,
            }),
            1 => Ok(KafkaResponseBeginEx::DeleteTopics {
                throttle_time_ms: r.i32()?,
                topics: read_topic_errors(r)?,
            }),
            2 => {
                let throttle_time_ms = r.i32()?;
                let error_code = r.i16()?;
                let cluster_id = r.string()?;
                let controller_id = r.i32()?;
                let count = r.array_len()?;
                let brokers = (0..count)
                    .map(|_| {
                        Ok(ClusterBroker {
                            broker_id: r.i32()?,
                            host: r.string()?,
                            port: r.i32()?,
                            rack: r.nullable_string()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(KafkaResponseBeginEx::DescribeCluster {
                    throttle_time_ms,
                    error_code,
                    cluster_id,
                    controller_id,
                    brokers,
                })
            }
            kind => Err(invalid_kind("response", kind)),
        }
    }
}

impl KafkaBeginEx {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            KafkaBeginEx::Consumer {
                group_id,
                consumer_id,
                timeout_ms,
                topic,
                partition_ids,
            } => {
                buf.put_u8(0);
                put_string(buf, group_id);
                put_string(buf, consumer_id);
                buf.put_i32(*timeout_ms);
                put_string(buf, topic);
                put_i32s(buf, partition_ids);
            }
            KafkaBeginEx::Produce {
                transaction,
                topic,
                partition,
            } => {
                buf.put_u8(1);
                put_nullable_string(buf, transaction.as_deref());
                put_string(buf, topic);
                partition.encode(buf);
            }
            KafkaBeginEx::Fetch { topic, partition } => {
                buf.put_u8(2);
                put_string(buf, topic);
                partition.encode(buf);
            }
            KafkaBeginEx::Describe { topic, configs } => {
                buf.put_u8(3);
                put_string(buf, topic);
                put_strings(buf, configs);
            }
            KafkaBeginEx::Request(request) => {
                buf.put_u8(4);
                request.encode(buf);
            }
            KafkaBeginEx::Response(response) => {
                buf.put_u8(5);
                response.encode(buf);
            }
            KafkaBeginEx::OffsetCommit {
                group_id,
                member_id,
                instance_id,
            } => {
                buf.put_u8(6);
                put_string(buf, group_id);
                put_string(buf, member_id);
                put_nullable_string(buf, instance_id.as_deref());
            }
            KafkaBeginEx::OffsetFetch {
                group_id,
                topic,
                partitions,
            } => {
                buf.put_u8(7);
                put_string(buf, group_id);
                put_string(buf, topic);
                put_i32s(buf, partitions);
            }
            KafkaBeginEx::Group {
                group_id,
                protocol,
                timeout_ms,
                instance_id,
                metadata,
            } => {
                buf.put_u8(8);
                put_string(buf, group_id);
                put_string(buf, protocol);
                buf.put_i32(*timeout_ms);
                put_nullable_string(buf, instance_id.as_deref());
                put_bytes(buf, metadata);
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.i8()? as u8 {
            0 => Ok(KafkaBeginEx::Consumer {
                group_id: r.string()?,
                consumer_id: r.string()?,
                timeout_ms: r.i32()?,
                topic: r.string()?,
                partition_ids: read_i32s(r)?,
            }),
            1 => Ok(KafkaBeginEx::Produce {
                transaction: r.nullable_string()?,
                topic: r.string()?,
                partition: KafkaOffset::decode(r)?,
            }),
            2 => Ok(KafkaBeginEx::Fetch {
                topic: r.string()?,
                partition: KafkaOffset::decode(r)?,
            }),
            3 => Ok(KafkaBeginEx::Describe {
                topic: r.string()?,
                configs: read_strings(r)?,
            }),
            4 => Ok(KafkaBeginEx::Request(KafkaRequestBeginEx::decode(r)?)),
            5 => Ok(KafkaBeginEx::Response(KafkaResponseBeginEx::decode(r)?)),
            6 => Ok(KafkaBeginEx::OffsetCommit {
                group_id: r.string()?,
                member_id: r.string()?,
                instance_id: r.nullable_string()?,
            }),
            7 => Ok(KafkaBeginEx::OffsetFetch {
                group_id: r.string()?,
                topic: r.string()?,
                partitions: read_i32s(r)?,
            }),
            8 => Ok(KafkaBeginEx::Group {
                group_id: r.string()?,
                protocol: r.string()?,
                timeout_ms: r.i32()?,
                instance_id: r.nullable_string()?,
                metadata: r.bytes()?,
            }),
            kind => Err(invalid_kind("begin", kind)),
        }
    }
}

impl KafkaDataEx {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            KafkaDataEx::Produce {
                deferred,
                timestamp,
                key,
                headers,
            } => {
                buf.put_u8(0);
                buf.put_i32(*deferred);
                buf.put_i64(*timestamp);
                put_nullable_bytes(buf, key.as_deref());
                put_headers(buf, headers);
            }
            KafkaDataEx::Fetch {
                deferred,
                timestamp,
                partition,
                key,
                headers,
            } => {
                buf.put_u8(1);
                buf.put_i32(*deferred);
                buf.put_i64(*timestamp);
                partition.encode(buf);
                put_nullable_bytes(buf, key.as_deref());
                put_headers(buf, headers);
            }
            KafkaDataEx::Describe { configs } => {
                buf.put_u8(2);
                buf.put_i32(configs.len() as i32);
                for (name, value) in configs {
                    put_string(buf, name);
                    put_nullable_string(buf, value.as_deref());
                }
            }
            KafkaDataEx::OffsetCommit {
                topic,
                partition,
                generation_id,
                leader_epoch,
            } => {
                buf.put_u8(3);
                put_string(buf, topic);
                partition.encode(buf);
                buf.put_i32(*generation_id);
                buf.put_i32(*leader_epoch);
            }
            KafkaDataEx::OffsetFetch { partitions } => {
                buf.put_u8(4);
                buf.put_i32(partitions.len() as i32);
                for partition in partitions {
                    partition.encode(buf);
                }
            }
            KafkaDataEx::Consumer {
                partitions,
                assignments,
            } => {
                buf.put_u8(5);
                put_i32s(buf, partitions);
                buf.put_i32(assignments.len() as i32);
                for assignment in assignments {
                    put_string(buf, &assignment.consumer_id);
                    buf.put_i32(assignment.partitions.len() as i32);
                    for topic in &assignment.partitions {
                        put_string(buf, &topic.topic);
                        put_i32s(buf, &topic.partitions);
                    }
                }
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.i8()? as u8 {
            0 => Ok(KafkaDataEx::Produce {
                deferred: r.i32()?,
                timestamp: r.i64()?,
                key: r.nullable_bytes()?,
                headers: read_headers(r)?,
            }),
            1 => Ok(KafkaDataEx::Fetch {
                deferred: r.i32()?,
                timestamp: r.i64()?,
                partition: KafkaOffset::decode(r)?,
                key: r.nullable_bytes()?,
                headers: read_headers(r)?,
            }),
            2 => {
                let count = r.array_len()?;
                let configs = (0..count)
                    .map(|_| Ok((r.string()?, r.nullable_string()?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(KafkaDataEx::Describe { configs })
            }
            3 => Ok(KafkaDataEx::OffsetCommit {
                topic: r.string()?,
                partition: KafkaOffset::decode(r)?,
                generation_id: r.i32()?,
                leader_epoch: r.i32()?,
            }),
            4 => {
                let count = r.array_len()?;
                let partitions = (0..count)
                    .map(|_| KafkaOffset::decode(r))
                    .collect::<Result<Vec<_>>>()?;
                Ok(KafkaDataEx::OffsetFetch { partitions })
            }
            5 => {
                let partitions = read_i32s(r)?;
                let count = r.array_len()?;
                let mut assignments = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let consumer_id = r.string()?;
                    let topic_count = r.array_len()?;
                    let topics = (0..topic_count)
                        .map(|_| {
                            Ok(TopicPartitions {
                                topic: r.string()?,
                                partitions: read_i32s(r)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    assignments.push(ConsumerAssignment {
                        consumer_id,
                        partitions: topics,
                    });
                }
                Ok(KafkaDataEx::Consumer {
                    partitions,
                    assignments,
                })
            }
            kind => Err(invalid_kind("data", kind)),
        }
    }
}

impl KafkaFlushEx {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            KafkaFlushEx::Produce { partition, error } => {
                buf.put_u8(0);
                partition.encode(buf);
                buf.put_i32(*error);
            }
            KafkaFlushEx::Fetch { partition } => {
                buf.put_u8(1);
                partition.encode(buf);
            }
            KafkaFlushEx::Group {
                leader_id,
                member_id,
                members,
            } => {
                buf.put_u8(2);
                put_string(buf, leader_id);
                put_string(buf, member_id);
                buf.put_i32(members.len() as i32);
                for member in members {
                    put_string(buf, &member.id);
                    put_bytes(buf, &member.metadata);
                }
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.i8()? as u8 {
            0 => Ok(KafkaFlushEx::Produce {
                partition: KafkaOffset::decode(r)?,
                error: r.i32()?,
            }),
            1 => Ok(KafkaFlushEx::Fetch {
                partition: KafkaOffset::decode(r)?,
            }),
            2 => {
                let leader_id = r.string()?;
                let member_id = r.string()?;
                let count = r.array_len()?;
                let members = (0..count)
                    .map(|_| {
                        Ok(GroupMember {
                            id: r.string()?,
                            metadata: r.bytes()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(KafkaFlushEx::Group {
                    leader_id,
                    member_id,
                    members,
                })
            }
            kind => Err(invalid_kind("flush", kind)),
        }
    }
}

impl KafkaResetEx {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.error);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self { error: r.i32()? })
    }
}

impl ProxyBeginEx {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host);
        buf.put_u16(self.port);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let host = r.string()?;
        let port = r.i16()? as u16;
        Ok(Self { host, port })
    }
}
