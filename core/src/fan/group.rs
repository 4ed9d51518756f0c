//! Consumer-group fan: the consumer streams of one group, one per topic,
//! join the group through a single upstream group stream.
//!
//! The upstream Begin carries the "highlander" protocol and the member
//! metadata (consumer id, subscribed topics with partitions). When the group
//! reports this gateway as leader, the fan computes a range assignment and
//! sends it upstream; the assignment that comes back is delivered to the
//! consumer stream of each topic.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

use super::{MemberStream, Upstream};
use crate::engine::{BindingKind, Context, StreamFactory};
use crate::frame::{
    is_initial, Begin, ConsumerAssignment, Frame, GroupMember, KafkaBeginEx, KafkaDataEx,
    KafkaFlushEx, KafkaKind, TopicPartitions, FLAGS_COMPLETE,
};
use crate::protocol::kafka::codec::{put_string, Result};
use crate::protocol::kafka::WireReader;

/// Assignment protocol announced to the group.
pub const GROUP_PROTOCOL: &str = "highlander";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMetadata {
    pub consumer_id: String,
    pub topics: Vec<TopicPartitions>,
}

impl MemberMetadata {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.consumer_id);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_topic_partitions(&mut buf, topic);
        }
        buf.freeze()
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let consumer_id = r.string()?;
        let count = r.array_len()?;
        let mut topics = Vec::with_capacity(count);
        for _ in 0..count {
            topics.push(topic_partitions(r)?);
        }
        Ok(Self {
            consumer_id,
            topics,
        })
    }
}

/// Partitions of one topic given to a member, with what every consumer of
/// the topic received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub topic: String,
    pub partitions: Vec<i32>,
    pub consumers: Vec<ConsumerAssignment>,
}

impl TopicAssignment {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.topic);
        put_partitions(buf, &self.partitions);
        buf.put_i32(self.consumers.len() as i32);
        for consumer in &self.consumers {
            put_string(buf, &consumer.consumer_id);
            buf.put_i32(consumer.partitions.len() as i32);
            for topic in &consumer.partitions {
                put_topic_partitions(buf, topic);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let topic = r.string()?;
        let partitions = partitions(r)?;
        let count = r.array_len()?;
        let mut consumers = Vec::with_capacity(count);
        for _ in 0..count {
            let consumer_id = r.string()?;
            let topics = r.array_len()?;
            let mut partitions = Vec::with_capacity(topics);
            for _ in 0..topics {
                partitions.push(topic_partitions(r)?);
            }
            consumers.push(ConsumerAssignment {
                consumer_id,
                partitions,
            });
        }
        Ok(Self {
            topic,
            partitions,
            consumers,
        })
    }
}

/// What the leader hands one group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAssignment {
    pub member_id: String,
    pub topics: Vec<TopicAssignment>,
}

pub fn encode_member_assignments(assignments: &[MemberAssignment]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(assignments.len() as i32);
    for assignment in assignments {
        put_string(&mut buf, &assignment.member_id);
        buf.put_i32(assignment.topics.len() as i32);
        for topic in &assignment.topics {
            topic.encode(&mut buf);
        }
    }
    buf.freeze()
}

pub fn decode_member_assignments(r: &mut WireReader<'_>) -> Result<Vec<MemberAssignment>> {
    let count = r.array_len()?;
    let mut assignments = Vec::with_capacity(count);
    for _ in 0..count {
        let member_id = r.string()?;
        let topics = decode_topic_assignments(r)?;
        assignments.push(MemberAssignment { member_id, topics });
    }
    Ok(assignments)
}

pub fn encode_topic_assignments(topics: &[TopicAssignment]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(topics.len() as i32);
    for topic in topics {
        topic.encode(&mut buf);
    }
    buf.freeze()
}

pub fn decode_topic_assignments(r: &mut WireReader<'_>) -> Result<Vec<TopicAssignment>> {
    let count = r.array_len()?;
    let mut topics = Vec::with_capacity(count);
    for _ in 0..count {
        topics.push(TopicAssignment::decode(r)?);
    }
    Ok(topics)
}

fn put_partitions(buf: &mut BytesMut, partitions: &[i32]) {
    buf.put_i32(partitions.len() as i32);
    for partition in partitions {
        buf.put_i32(*partition);
    }
}

fn partitions(r: &mut WireReader<'_>) -> Result<Vec<i32>> {
    let count = r.array_len()?;
    let mut partitions = Vec::with_capacity(count);
    for _ in 0..count {
        partitions.push(r.i32()?);
    }
    Ok(partitions)
}

fn put_topic_partitions(buf: &mut BytesMut, topic: &TopicPartitions) {
    put_string(buf, &topic.topic);
    put_partitions(buf, &topic.partitions);
}

fn topic_partitions(r: &mut WireReader<'_>) -> Result<TopicPartitions> {
    Ok(TopicPartitions {
        topic: r.string()?,
        partitions: partitions(r)?,
    })
}

/// Range assignment: per topic, the sorted partitions are split over the
/// sorted subscribed members, `n / members` each, with the remainder going
/// to the first member.
pub fn range_assignment(members: &[(String, MemberMetadata)]) -> Vec<MemberAssignment> {
    let mut sorted: Vec<&(String, MemberMetadata)> = members.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut subscriptions: BTreeMap<&str, (Vec<i32>, Vec<&(String, MemberMetadata)>)> =
        BTreeMap::new();
    for member in &sorted {
        for topic in &member.1.topics {
            let (partitions, subscribers) = subscriptions.entry(topic.topic.as_str()).or_default();
            partitions.extend_from_slice(&topic.partitions);
            subscribers.push(member);
        }
    }

    let mut assignments: Vec<MemberAssignment> = sorted
        .iter()
        .map(|(member_id, _)| MemberAssignment {
            member_id: member_id.clone(),
            topics: Vec::new(),
        })
        .collect();

    for (topic, (mut partitions, subscribers)) in subscriptions {
        partitions.sort_unstable();
        partitions.dedup();
        let count = subscribers.len();
        let each = partitions.len() / count;
        let extra = partitions.len() % count;

        let mut shares = Vec::with_capacity(count);
        let mut start = 0;
        for index in 0..count {
            let length = if index == 0 { each + extra } else { each };
            shares.push(partitions[start..start + length].to_vec());
            start += length;
        }

        let consumers: Vec<ConsumerAssignment> = subscribers
            .iter()
            .zip(&shares)
            .map(|((_, metadata), share)| ConsumerAssignment {
                consumer_id: metadata.consumer_id.clone(),
                partitions: vec![TopicPartitions {
                    topic: topic.to_string(),
                    partitions: share.clone(),
                }],
            })
            .collect();

        for ((member_id, _), share) in subscribers.iter().zip(shares) {
            if let Some(assignment) = assignments
                .iter_mut()
                .find(|assignment| &assignment.member_id == member_id)
            {
                assignment.topics.push(TopicAssignment {
                    topic: topic.to_string(),
                    partitions: share,
                    consumers: consumers.clone(),
                });
            }
        }
    }
    assignments
}

#[derive(Debug)]
struct ConsumerMember {
    stream: MemberStream,
    fan_id: u64,
    topic: String,
    partition_ids: Vec<i32>,
    extension: KafkaBeginEx,
    /// Assignment waiting for reply credit.
    pending: Option<KafkaDataEx>,
}

impl ConsumerMember {
    fn do_assignment_if_necessary(&mut self, cx: &mut Context<'_>) {
        if !self.stream.is_reply_open() || !self.stream.state.reply_opened() {
            return;
        }
        let padding = self.stream.reply.padding;
        if padding > self.stream.reply.budget() {
            return;
        }
        if let Some(extension) = self.pending.take() {
            self.stream
                .do_reply_data(cx, FLAGS_COMPLETE, padding, None, Some(extension));
        }
    }
}

#[derive(Debug)]
struct GroupFan {
    fan_id: u64,
    group_id: String,
    consumer_id: String,
    timeout_ms: i32,
    affinity: u64,
    leader_id: String,
    member_id: String,
    members: Vec<u64>,
    upstream: Upstream,
    assignments: HashMap<String, TopicAssignment>,
    /// Leader assignment waiting for upstream credit.
    pending: Option<Bytes>,
}

impl GroupFan {
    fn metadata(&self, members: &HashMap<u64, ConsumerMember>) -> MemberMetadata {
        MemberMetadata {
            consumer_id: self.consumer_id.clone(),
            topics: self
                .members
                .iter()
                .filter_map(|id| members.get(id))
                .map(|member| TopicPartitions {
                    topic: member.topic.clone(),
                    partitions: member.partition_ids.clone(),
                })
                .collect(),
        }
    }

    fn do_initial_data_if_necessary(&mut self, cx: &mut Context<'_>) {
        let Some(payload) = self.pending.as_ref() else {
            return;
        };
        if !self.upstream.is_initial_open() || !self.upstream.state.initial_opened() {
            return;
        }
        let reserved = payload.len() as i64 + self.upstream.initial.padding as i64;
        if reserved > self.upstream.initial.budget() as i64 {
            return;
        }
        let payload = self.pending.take();
        let header = self.upstream.initial_header();
        cx.data(
            header,
            FLAGS_COMPLETE,
            self.upstream.initial.budget_id,
            reserved as i32,
            payload,
            None,
        );
        self.upstream.initial.sent(reserved as i32);
    }
}

/// Joins consumer streams to their group through one upstream per group.
#[derive(Default)]
pub struct GroupFanFactory {
    fans: HashMap<u64, GroupFan>,
    fans_by_group: HashMap<String, u64>,
    fans_by_upstream: HashMap<u64, u64>,
    members: HashMap<u64, ConsumerMember>,
    next_fan_id: u64,
}

impl GroupFanFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fan_count(&self) -> usize {
        self.fans.len()
    }

    fn on_member_opening(&mut self, cx: &mut Context<'_>, fan_id: u64, member_id: u64) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        fan.members.push(member_id);

        if !fan.upstream.is_initial_open() {
            let metadata = fan.metadata(&self.members).encode();
            let extension = KafkaBeginEx::Group {
                group_id: fan.group_id.clone(),
                protocol: GROUP_PROTOCOL.to_string(),
                timeout_ms: fan.timeout_ms,
                instance_id: cx.config().group_instance_id.clone(),
                metadata,
            };
            let previous = fan.upstream.initial_id;
            if let Some(upstream_id) = fan.upstream.do_begin_if_necessary(cx, fan.affinity, extension) {
                self.fans_by_upstream.remove(&previous);
                self.fans_by_upstream.insert(upstream_id, fan_id);
            }
        } else if let Some(member) = self.members.get(&member_id) {
            if !fan.assignments.contains_key(&member.topic) {
                let metadata = fan.metadata(&self.members).encode();
                debug!("group {} rejoining for {}", fan.group_id, member.topic);
                let header = fan.upstream.initial_header();
                cx.flush(
                    header,
                    fan.upstream.initial.budget_id,
                    0,
                    Some(KafkaFlushEx::Group {
                        leader_id: fan.leader_id.clone(),
                        member_id: fan.member_id.clone(),
                        members: vec![GroupMember {
                            id: fan.member_id.clone(),
                            metadata,
                        }],
                    }),
                );
            }
        }

        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        if fan.upstream.state.reply_opening() && !fan.upstream.state.reply_closed() {
            member
                .stream
                .do_reply_begin_if_necessary(cx, member.extension.clone());
        }
        if let Some(assignment) = fan.assignments.get(&member.topic) {
            member.pending = Some(KafkaDataEx::Consumer {
                partitions: assignment.partitions.clone(),
                assignments: assignment.consumers.clone(),
            });
            member.do_assignment_if_necessary(cx);
        }
    }

    fn on_member_closed(&mut self, cx: &mut Context<'_>, member_id: u64) {
        let Some(member) = self.members.remove(&member_id) else {
            return;
        };
        let Some(fan) = self.fans.get_mut(&member.fan_id) else {
            return;
        };
        fan.members.retain(|id| *id != member_id);
        if fan.members.is_empty() {
            fan.upstream.do_initial_end_if_necessary(cx);
            fan.upstream.state.close_reply();
            let fan_id = fan.fan_id;
            self.remove_fan(fan_id);
        }
    }

    fn remove_fan(&mut self, fan_id: u64) {
        if let Some(fan) = self.fans.remove(&fan_id) {
            self.fans_by_group.remove(&fan.group_id);
            self.fans_by_upstream.remove(&fan.upstream.initial_id);
            debug!("group fan {} closed for {}", fan_id, fan.group_id);
        }
    }

    fn on_member_frame(&mut self, cx: &mut Context<'_>, member_id: u64, frame: Frame) {
        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        match frame {
            Frame::Window(window) => {
                if let Err(e) = member.stream.on_reply_window(&window) {
                    warn!("consumer {} window rejected: {}", member_id, e);
                    member.stream.cleanup(cx, 0);
                    self.on_member_closed(cx, member_id);
                    return;
                }
                member.do_assignment_if_necessary(cx);
            }
            Frame::End(_) => {
                member.stream.state.close_initial();
                member.stream.do_reply_end_if_necessary(cx);
                self.on_member_closed(cx, member_id);
            }
            Frame::Abort(_) => {
                member.stream.state.close_initial();
                member.stream.do_reply_abort_if_necessary(cx);
                self.on_member_closed(cx, member_id);
            }
            Frame::Reset(_) => {
                member.stream.state.close_reply();
                member.stream.do_initial_reset_if_necessary(cx, 0);
                self.on_member_closed(cx, member_id);
            }
            Frame::Begin(_) | Frame::Data(_) | Frame::Flush(_) | Frame::Signal(_) => {}
        }
    }

    fn on_group_flush(&mut self, cx: &mut Context<'_>, fan_id: u64, extension: Option<KafkaFlushEx>) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        let Some(KafkaFlushEx::Group {
            leader_id,
            member_id,
            members,
        }) = extension
        else {
            return;
        };
        fan.leader_id = leader_id;
        fan.member_id = member_id;

        let assignments = if fan.leader_id == fan.member_id {
            let mut subscriptions = Vec::with_capacity(members.len());
            for member in members {
                match MemberMetadata::decode(&mut WireReader::new(&member.metadata)) {
                    Ok(metadata) => subscriptions.push((member.id, metadata)),
                    Err(e) => warn!("group {} member {} metadata: {}", fan.group_id, member.id, e),
                }
            }
            let assignments = range_assignment(&subscriptions);
            debug!(
                "group {} leader assigned {} members",
                fan.group_id,
                assignments.len()
            );
            assignments
        } else {
            Vec::new()
        };
        fan.pending = Some(encode_member_assignments(&assignments));
        fan.do_initial_data_if_necessary(cx);
    }

    fn on_group_data(&mut self, cx: &mut Context<'_>, fan_id: u64, payload: Option<Bytes>) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        let payload = payload.unwrap_or_default();
        let topics = match decode_topic_assignments(&mut WireReader::new(&payload)) {
            Ok(topics) => topics,
            Err(e) => {
                warn!("group {} assignment rejected: {}", fan.group_id, e);
                return;
            }
        };

        fan.assignments.clear();
        for assignment in topics {
            for member_id in &fan.members {
                let Some(member) = self.members.get_mut(member_id) else {
                    continue;
                };
                if member.topic == assignment.topic {
                    member.pending = Some(KafkaDataEx::Consumer {
                        partitions: assignment.partitions.clone(),
                        assignments: assignment.consumers.clone(),
                    });
                    member.do_assignment_if_necessary(cx);
                }
            }
            fan.assignments.insert(assignment.topic.clone(), assignment);
        }
        let maximum = cx.config().slot_capacity as i32;
        fan.upstream.do_reply_window_if_necessary(cx, maximum);
    }

    fn on_upstream_frame(&mut self, cx: &mut Context<'_>, fan_id: u64, frame: Frame) {
        match frame {
            Frame::Flush(flush) => return self.on_group_flush(cx, fan_id, flush.extension),
            Frame::Data(data) => {
                if let Some(fan) = self.fans.get_mut(&fan_id) {
                    if let Err(e) = fan
                        .upstream
                        .reply
                        .on_data(data.header.sequence, data.reserved)
                    {
                        warn!("group fan {} data rejected: {}", fan_id, e);
                        return;
                    }
                }
                return self.on_group_data(cx, fan_id, data.payload);
            }
            _ => {}
        }

        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        match frame {
            Frame::Begin(_) => {
                fan.upstream.state.open_reply();
                for member_id in &fan.members {
                    if let Some(member) = self.members.get_mut(member_id) {
                        member
                            .stream
                            .do_reply_begin_if_necessary(cx, member.extension.clone());
                    }
                }
                let maximum = cx.config().slot_capacity as i32;
                fan.upstream.do_reply_window_if_necessary(cx, maximum);
            }
            Frame::Window(window) => {
                if let Err(e) = fan.upstream.on_initial_window(&window) {
                    warn!("group fan {} window rejected: {}", fan_id, e);
                    return;
                }
                fan.do_initial_data_if_necessary(cx);
            }
            Frame::End(_) => {
                fan.upstream.state.close_reply();
                for member_id in std::mem::take(&mut fan.members) {
                    if let Some(mut member) = self.members.remove(&member_id) {
                        member.stream.do_reply_end_if_necessary(cx);
                    }
                }
                fan.upstream.do_initial_end_if_necessary(cx);
                self.remove_fan(fan_id);
            }
            Frame::Abort(_) => {
                fan.upstream.state.close_reply();
                for member_id in std::mem::take(&mut fan.members) {
                    if let Some(mut member) = self.members.remove(&member_id) {
                        member.stream.cleanup(cx, 0);
                    }
                }
                fan.upstream.do_initial_abort_if_necessary(cx);
                self.remove_fan(fan_id);
            }
            Frame::Reset(reset) => {
                let error = reset.error();
                fan.upstream.on_initial_closed();
                fan.upstream.do_reply_reset_if_necessary(cx);
                for member_id in std::mem::take(&mut fan.members) {
                    if let Some(mut member) = self.members.remove(&member_id) {
                        member.stream.cleanup(cx, error);
                    }
                }
                self.remove_fan(fan_id);
            }
            Frame::Data(_) | Frame::Flush(_) | Frame::Signal(_) => {}
        }
    }
}

impl StreamFactory for GroupFanFactory {
    fn kinds(&self) -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Consumer)]
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
        let member_id = begin.header.stream_id;
        if !is_initial(member_id) || self.members.contains_key(&member_id) {
            return false;
        }
        let Some(extension) = begin.extension.kafka() else {
            return false;
        };
        let KafkaBeginEx::Consumer {
            group_id,
            consumer_id,
            timeout_ms,
            topic,
            partition_ids,
        } = extension
        else {
            return false;
        };

        let fan_id = match self.fans_by_group.get(group_id) {
            Some(fan_id) => *fan_id,
            None => {
                self.next_fan_id += 1;
                let fan_id = self.next_fan_id;
                self.fans.insert(
                    fan_id,
                    GroupFan {
                        fan_id,
                        group_id: group_id.clone(),
                        consumer_id: consumer_id.clone(),
                        timeout_ms: *timeout_ms,
                        affinity: begin.affinity,
                        leader_id: String::new(),
                        member_id: String::new(),
                        members: Vec::new(),
                        upstream: Upstream::default(),
                        assignments: HashMap::new(),
                        pending: None,
                    },
                );
                self.fans_by_group.insert(group_id.clone(), fan_id);
                debug!("group fan {} opened for {}", fan_id, group_id);
                fan_id
            }
        };

        self.members.insert(
            member_id,
            ConsumerMember {
                stream: MemberStream::new(begin),
                fan_id,
                topic: topic.clone(),
                partition_ids: partition_ids.clone(),
                extension: extension.clone(),
                pending: None,
            },
        );
        self.on_member_opening(cx, fan_id, member_id);
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        let initial_id = frame.stream_id() | 1;
        if let Some(fan_id) = self.fans_by_upstream.get(&initial_id).copied() {
            self.on_upstream_frame(cx, fan_id, frame);
        } else if self.members.contains_key(&initial_id) {
            self.on_member_frame(cx, initial_id, frame);
        } else {
            trace!("group fan dropped {} for {}", frame.name(), frame.stream_id());
        }
    }
}
