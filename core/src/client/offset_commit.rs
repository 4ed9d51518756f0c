//! OffsetCommit (v7): the application writes one Data frame per commit and
//! the client sends them one request at a time.

use bytes::BytesMut;
use std::collections::VecDeque;

use super::{DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::BindingKind;
use crate::frame::{Begin, Data, KafkaBeginEx, KafkaDataEx, KafkaKind, KafkaOffset};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::{
    OffsetCommitPartitionResponse, OffsetCommitRequest, OffsetCommitResponse, RequestHeader,
    ResponseHeader, TopicResponseHeader, WireReader, API_KEY_OFFSET_COMMIT,
    API_VERSION_OFFSET_COMMIT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetCommitStep {
    Response,
    Topic { topics: usize },
    Partition { topics: usize, partitions: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Commit {
    topic: String,
    partition: KafkaOffset,
    generation_id: i32,
    leader_epoch: i32,
    reserved: i32,
}

pub struct OffsetCommitProtocol {
    group_id: String,
    member_id: String,
    instance_id: Option<String>,
    commits: VecDeque<Commit>,
    inflight: Option<Commit>,
    unacked: i64,
}

impl OffsetCommitProtocol {
    pub fn new(group_id: String, member_id: String, instance_id: Option<String>) -> Self {
        Self {
            group_id,
            member_id,
            instance_id,
            commits: VecDeque::new(),
            inflight: None,
            unacked: 0,
        }
    }

    fn completed(&mut self, effects: &mut Vec<Effect>) -> Step<OffsetCommitStep> {
        if let Some(commit) = self.inflight.take() {
            self.unacked -= commit.reserved as i64;
        }
        effects.push(Effect::AppBegin(KafkaBeginEx::OffsetCommit {
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            instance_id: self.instance_id.clone(),
        }));
        effects.push(Effect::AppWindow);
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NextRequest);
        Step::Idle
    }

    fn next_topic(&mut self, topics: usize, effects: &mut Vec<Effect>) -> Step<OffsetCommitStep> {
        match topics {
            0 => self.completed(effects),
            topics => Step::Protocol(OffsetCommitStep::Topic { topics }),
        }
    }

    pub fn queued(&self) -> usize {
        self.commits.len()
    }
}

impl RequestProtocol for OffsetCommitProtocol {
    type Step = OffsetCommitStep;

    const NAME: &'static str = "offset-commit";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::OffsetCommit)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::OffsetCommit {
                group_id,
                member_id,
                instance_id,
            } => Some(Self::new(
                group_id.clone(),
                member_id.clone(),
                instance_id.clone(),
            )),
            _ => None,
        }
    }

    fn opened(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::AppWindow);
    }

    fn on_app_data(&mut self, data: &Data, _effects: &mut Vec<Effect>) -> std::result::Result<(), i32> {
        match &data.extension {
            Some(KafkaDataEx::OffsetCommit {
                topic,
                partition,
                generation_id,
                leader_epoch,
            }) => {
                self.unacked += data.reserved as i64;
                self.commits.push_back(Commit {
                    topic: topic.clone(),
                    partition: partition.clone(),
                    generation_id: *generation_id,
                    leader_epoch: *leader_epoch,
                    reserved: data.reserved,
                });
                Ok(())
            }
            _ => Err(0),
        }
    }

    fn app_credit(&self, config: &GatewayConfig) -> i32 {
        config.slot_capacity as i32
    }

    fn app_unacked(&self) -> i64 {
        self.unacked
    }

    fn has_request(&self) -> bool {
        !self.commits.is_empty()
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        let Some(commit) = self.commits.pop_front() else {
            return;
        };
        let request = OffsetCommitRequest {
            group_id: self.group_id.clone(),
            generation_id: commit.generation_id,
            member_id: self.member_id.clone(),
            group_instance_id: self.instance_id.clone(),
            topic: commit.topic.clone(),
            partition_index: commit.partition.partition_id,
            committed_offset: commit.partition.partition_offset,
            committed_leader_epoch: commit.leader_epoch,
            committed_metadata: commit.partition.metadata.clone(),
        };
        RequestHeader::new(API_KEY_OFFSET_COMMIT, API_VERSION_OFFSET_COMMIT, correlation_id)
            .with_client_id(Some(&config.client_id))
            .encode_with(buf, |buf| request.encode(buf));
        self.inflight = Some(commit);
    }

    fn first_step(&self) -> OffsetCommitStep {
        OffsetCommitStep::Response
    }

    fn decode(
        &mut self,
        step: OffsetCommitStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<OffsetCommitStep>> {
        match step {
            OffsetCommitStep::Response => {
                ResponseHeader::decode_for(r, API_KEY_OFFSET_COMMIT, API_VERSION_OFFSET_COMMIT)?;
                let response = OffsetCommitResponse::decode(r)?;
                Ok(self.next_topic(response.topic_count, effects))
            }
            OffsetCommitStep::Topic { topics } => {
                let topic = TopicResponseHeader::decode(r)?;
                match topic.partition_count {
                    0 => Ok(self.next_topic(topics - 1, effects)),
                    partitions => Ok(Step::Protocol(OffsetCommitStep::Partition {
                        topics,
                        partitions,
                    })),
                }
            }
            OffsetCommitStep::Partition { topics, partitions } => {
                let partition = OffsetCommitPartitionResponse::decode(r)?;
                if partition.error_code != 0 {
                    return Ok(Step::Reject(partition.error_code as i32));
                }
                match partitions - 1 {
                    0 => Ok(self.next_topic(topics - 1, effects)),
                    partitions => Ok(Step::Protocol(OffsetCommitStep::Partition {
                        topics,
                        partitions,
                    })),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{context, decode_all, response};
    use crate::frame::FrameHeader;
    use crate::protocol::kafka::codec::put_string;
    use bytes::BufMut;

    fn commit(offset: i64, reserved: i32) -> Data {
        Data {
            header: FrameHeader::new(0, 2, 1),
            flags: crate::frame::FLAGS_COMPLETE,
            budget_id: 0,
            reserved,
            payload: None,
            extension: Some(KafkaDataEx::OffsetCommit {
                topic: "events".to_string(),
                partition: KafkaOffset::new(0, offset),
                generation_id: 3,
                leader_epoch: -1,
            }),
        }
    }

    fn body(error_code: i16) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(0);
        body.put_i32(1);
        put_string(&mut body, "events");
        body.put_i32(1);
        body.put_i32(0);
        body.put_i16(error_code);
        response(0, &body)
    }

    fn protocol() -> OffsetCommitProtocol {
        OffsetCommitProtocol::new("group".to_string(), "member-1".to_string(), None)
    }

    #[test]
    fn test_commits_are_sent_in_order() {
        let mut protocol = protocol();
        let config = GatewayConfig::default();
        protocol.on_app_data(&commit(10, 16), &mut Vec::new()).unwrap();
        protocol.on_app_data(&commit(11, 16), &mut Vec::new()).unwrap();
        assert_eq!(protocol.app_unacked(), 32);

        let mut buf = BytesMut::new();
        protocol.encode_request(&config, &mut buf, 0);
        assert_eq!(protocol.queued(), 1);
        assert_eq!(protocol.inflight.as_ref().map(|c| c.partition.partition_offset), Some(10));

        let (step, progress, effects) = decode_all(
            &mut protocol,
            Step::Protocol(OffsetCommitStep::Response),
            &body(0),
            &context(0),
        );
        assert_eq!(step, Step::Idle);
        assert_eq!(progress, body(0).len());
        assert_eq!(protocol.app_unacked(), 16);
        assert!(effects.contains(&Effect::NextRequest));
        assert!(protocol.has_request());
    }

    #[test]
    fn test_partition_error_rejects() {
        let mut protocol = protocol();
        protocol.on_app_data(&commit(10, 0), &mut Vec::new()).unwrap();
        protocol.encode_request(&GatewayConfig::default(), &mut BytesMut::new(), 0);
        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(OffsetCommitStep::Response),
            &body(22),
            &context(0),
        );
        assert_eq!(step, Step::Reject(22));
    }

    #[test]
    fn test_data_without_commit_is_refused() {
        let mut protocol = protocol();
        let mut data = commit(0, 0);
        data.extension = None;
        assert_eq!(protocol.on_app_data(&data, &mut Vec::new()), Err(0));
    }

    #[test]
    fn test_split_at_every_byte() {
        let bytes = body(0);
        for split in 1..bytes.len() {
            let mut protocol = protocol();
            let dcx = context(0);
            let (step, progress, _) = decode_all(
                &mut protocol,
                Step::Protocol(OffsetCommitStep::Response),
                &bytes[..split],
                &dcx,
            );
            let (step, rest, _) = decode_all(&mut protocol, step, &bytes[progress..], &dcx);
            assert_eq!(step, Step::Idle, "split at {}", split);
            assert_eq!(progress + rest, bytes.len());
        }
    }
}
