//! OffsetFetch (v0) for one topic of a group.

use bytes::BytesMut;
use tracing::debug;

use super::{DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::BindingKind;
use crate::frame::{Begin, KafkaBeginEx, KafkaDataEx, KafkaKind, KafkaOffset, FLAGS_COMPLETE};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    KafkaErrorCode, OffsetFetchPartitionResponse, OffsetFetchRequest, OffsetFetchResponse,
    RequestHeader, ResponseHeader, TopicResponseHeader, WireReader, API_KEY_OFFSET_FETCH,
    API_VERSION_OFFSET_FETCH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetFetchStep {
    Response,
    Topic { topics: usize },
    Partition { topics: usize, partitions: usize },
}

pub struct OffsetFetchProtocol {
    group_id: String,
    topic: String,
    partition_ids: Vec<i32>,
    requested: bool,
    partitions: Vec<KafkaOffset>,
}

impl OffsetFetchProtocol {
    pub fn new(group_id: String, topic: String, partition_ids: Vec<i32>) -> Self {
        Self {
            group_id,
            topic,
            partition_ids,
            requested: false,
            partitions: Vec::new(),
        }
    }

    fn next_topic(&mut self, topics: usize, effects: &mut Vec<Effect>) -> Step<OffsetFetchStep> {
        if topics > 0 {
            return Step::Protocol(OffsetFetchStep::Topic { topics });
        }
        effects.push(Effect::AppData {
            flags: FLAGS_COMPLETE,
            payload: None,
            extension: Some(KafkaDataEx::OffsetFetch {
                partitions: std::mem::take(&mut self.partitions),
            }),
        });
        effects.push(Effect::ResponseComplete);
        Step::Idle
    }
}

/// Partition errors that leave the partition without a committed offset.
fn is_skipped(error_code: i16) -> bool {
    error_code == KafkaErrorCode::UnknownTopicOrPartition.as_i16()
        || error_code == KafkaErrorCode::TopicAuthorizationFailed.as_i16()
}

impl RequestProtocol for OffsetFetchProtocol {
    type Step = OffsetFetchStep;

    const NAME: &'static str = "offset-fetch";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::OffsetFetch)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::OffsetFetch {
                group_id,
                topic,
                partitions,
            } => Some(Self::new(group_id.clone(), topic.clone(), partitions.clone())),
            _ => None,
        }
    }

    fn opened(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::AppBegin(KafkaBeginEx::OffsetFetch {
            group_id: self.group_id.clone(),
            topic: self.topic.clone(),
            partitions: self.partition_ids.clone(),
        }));
        effects.push(Effect::AppWindow);
    }

    fn has_request(&self) -> bool {
        !self.requested
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        let request = OffsetFetchRequest {
            group_id: self.group_id.clone(),
            topic: self.topic.clone(),
            partitions: self.partition_ids.clone(),
        };
        RequestHeader::new(API_KEY_OFFSET_FETCH, API_VERSION_OFFSET_FETCH, correlation_id)
            .with_client_id(Some(&config.client_id))
            .encode_with(buf, |buf| request.encode(buf));
        self.requested = true;
    }

    fn first_step(&self) -> OffsetFetchStep {
        OffsetFetchStep::Response
    }

    fn decode(
        &mut self,
        step: OffsetFetchStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<OffsetFetchStep>> {
        match step {
            OffsetFetchStep::Response => {
                ResponseHeader::decode_for(r, API_KEY_OFFSET_FETCH, API_VERSION_OFFSET_FETCH)?;
                let response = OffsetFetchResponse::decode(r)?;
                self.partitions.clear();
                Ok(self.next_topic(response.topic_count, effects))
            }
            OffsetFetchStep::Topic { topics } => {
                let topic = TopicResponseHeader::decode(r)?;
                if topic.name != self.topic {
                    debug!("offset fetch for {} answered {}", self.topic, topic.name);
                    return Ok(Step::Reject(0));
                }
                match topic.partition_count {
                    0 => Ok(self.next_topic(topics - 1, effects)),
                    partitions => Ok(Step::Protocol(OffsetFetchStep::Partition {
                        topics,
                        partitions,
                    })),
                }
            }
            OffsetFetchStep::Partition { topics, partitions } => {
                let partition = OffsetFetchPartitionResponse::decode(r)?;
                match partition.error_code {
                    0 => {
                        let mut offset =
                            KafkaOffset::new(partition.partition_index, partition.committed_offset);
                        offset.metadata = partition.metadata;
                        self.partitions.push(offset);
                    }
                    code if is_skipped(code) => {}
                    code => return Ok(Step::Reject(code as i32)),
                }
                match partitions - 1 {
                    0 => Ok(self.next_topic(topics - 1, effects)),
                    partitions => Ok(Step::Protocol(OffsetFetchStep::Partition {
                        topics,
                        partitions,
                    })),
                }
            }
        }
    }
}
