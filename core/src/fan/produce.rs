//! Produce fan: every producer of one topic partition shares a single
//! upstream produce stream.
//!
//! Members append completed records to the partition cache under their own
//! stream id. The fan drains them round-robin, one record per member per
//! turn, fragmenting values to fit the upstream window. A turn that made
//! progress restarts the count of members not progressing, so the loop only
//! stops once a full pass over the members moved nothing.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

use super::{is_reconnectable, MemberStream, Reconnect, Upstream, SIGNAL_RECONNECT};
use crate::cache::{CacheEntry, CacheKind, OFFSET_LATEST};
use crate::engine::{BindingKind, Context, StreamFactory};
use crate::flow::Reservation;
use crate::frame::{
    is_initial, Begin, Data, Frame, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaKind,
    KafkaOffset, Signal, FLAG_FIN, FLAG_INIT,
};
use crate::protocol::kafka::KafkaErrorCode;

/// Record still arriving from a member in fragments.
#[derive(Debug)]
struct Assembly {
    entry: CacheEntry,
    value: Option<BytesMut>,
    reserved: i64,
}

#[derive(Debug)]
struct ProduceMember {
    stream: MemberStream,
    fan_id: u64,
    extension: KafkaBeginEx,
    /// Next cache position to forward.
    cursor: u64,
    /// Bytes of the current record already forwarded.
    message_offset: usize,
    assembly: Option<Assembly>,
    /// Credit charged by each appended record not yet forwarded.
    undelivered: VecDeque<i64>,
    unacked: i64,
}

impl ProduceMember {
    /// Members buffer up to one slot of records in the cache.
    fn do_initial_window_if_necessary(&mut self, cx: &mut Context<'_>) {
        let maximum = cx.config().slot_capacity as i32;
        self.stream
            .do_initial_window_if_necessary(cx, self.unacked, maximum);
    }

    fn is_drained(&self) -> bool {
        self.stream.state.initial_closed()
            && self.message_offset == 0
            && self.undelivered.is_empty()
    }
}

#[derive(Debug)]
struct ProduceFan {
    fan_id: u64,
    topic: String,
    partition_id: i32,
    transaction: Option<String>,
    leader_id: u64,
    members: Vec<u64>,
    member_index: usize,
    upstream: Upstream,
    initial_flags: u8,
    reconnect: Reconnect,
}

impl ProduceFan {
    fn begin_extension(&self) -> KafkaBeginEx {
        KafkaBeginEx::Produce {
            transaction: self.transaction.clone(),
            topic: self.topic.clone(),
            partition: KafkaOffset::new(self.partition_id, OFFSET_LATEST),
        }
    }

    fn do_initial_data(
        &mut self,
        cx: &mut Context<'_>,
        flags: u8,
        reserved: i32,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    ) {
        let header = self.upstream.initial_header();
        cx.data(
            header,
            flags,
            self.upstream.initial.budget_id,
            reserved,
            payload,
            extension,
        );
        self.upstream.initial.sent(reserved);
        self.initial_flags = if flags & FLAG_FIN != 0 {
            0
        } else {
            self.initial_flags | flags
        };
    }
}

/// Forwards the next fragment of `member`'s current record, if any fits.
fn do_produce_initial_data(
    cx: &mut Context<'_>,
    fan: &mut ProduceFan,
    member: &mut ProduceMember,
) {
    if !fan.upstream.state.initial_opened() || fan.upstream.state.initial_closed() {
        return;
    }
    let next = cx
        .cache()
        .partition(CacheKind::Produce, &fan.topic, fan.partition_id)
        .and_then(|partition| partition.next_for(member.cursor, member.stream.initial_id))
        .map(|(position, entry)| (position, entry.clone()));
    let Some((position, entry)) = next else {
        return;
    };

    let size = entry.size();
    let remaining = size - member.message_offset;
    let Reservation::Send { reserved, length } = fan.upstream.initial.reserve(remaining) else {
        return;
    };

    let init = member.message_offset == 0;
    let fin = length == remaining;
    let mut flags = 0;
    if init {
        flags |= FLAG_INIT;
    }
    if fin {
        flags |= FLAG_FIN;
    }
    let payload = entry
        .value
        .as_ref()
        .map(|value| value.slice(member.message_offset..member.message_offset + length));
    let extension = init.then(|| KafkaDataEx::Produce {
        deferred: (remaining - length) as i32,
        timestamp: entry.timestamp,
        key: entry.key.clone(),
        headers: entry.headers.clone(),
    });
    fan.do_initial_data(cx, flags, reserved, payload, extension);

    if fin {
        member.message_offset = 0;
        member.cursor = position + 1;
        member.unacked -= member.undelivered.pop_front().unwrap_or(0);
        member.do_initial_window_if_necessary(cx);
    } else {
        member.message_offset += length;
    }
}

/// Fans produce streams into one upstream per topic partition.
#[derive(Default)]
pub struct ProduceFanFactory {
    fans: HashMap<u64, ProduceFan>,
    fans_by_key: HashMap<(String, i32), u64>,
    fans_by_upstream: HashMap<u64, u64>,
    members: HashMap<u64, ProduceMember>,
    next_fan_id: u64,
}

impl ProduceFanFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fan_count(&self) -> usize {
        self.fans.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn supply_fan(
        &mut self,
        cx: &mut Context<'_>,
        begin: &Begin,
        transaction: &Option<String>,
        topic: &str,
        partition_id: i32,
    ) -> u64 {
        let key = (topic.to_string(), partition_id);
        if let Some(fan_id) = self.fans_by_key.get(&key) {
            return *fan_id;
        }
        self.next_fan_id += 1;
        let fan_id = self.next_fan_id;
        let max_delay_ms = cx.config().reconnect_max_delay_ms();
        self.fans.insert(
            fan_id,
            ProduceFan {
                fan_id,
                topic: topic.to_string(),
                partition_id,
                transaction: transaction.clone(),
                leader_id: begin.affinity,
                members: Vec::new(),
                member_index: 0,
                upstream: Upstream::default(),
                initial_flags: 0,
                reconnect: Reconnect::new(max_delay_ms),
            },
        );
        self.fans_by_key.insert(key, fan_id);
        debug!("produce fan {} opened for {}-{}", fan_id, topic, partition_id);
        fan_id
    }

    fn on_member_opening(&mut self, cx: &mut Context<'_>, fan_id: u64, member_id: u64) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        let affinity = self.members.get(&member_id).map_or(0, |m| m.stream.affinity);

        if affinity != fan.leader_id {
            debug!(
                "produce fan {} leader {} replaced by {}",
                fan_id, fan.leader_id, affinity
            );
            fan.reconnect.cancel(cx);
            fan.upstream.do_initial_abort_if_necessary(cx);
            fan.upstream.do_reply_reset_if_necessary(cx);
            fan.initial_flags = 0;
            fan.leader_id = affinity;
            for evicted in std::mem::take(&mut fan.members) {
                if let Some(mut member) = self.members.remove(&evicted) {
                    member
                        .stream
                        .cleanup(cx, KafkaErrorCode::NotLeaderForPartition.as_i32());
                    cx.cache()
                        .partition_mut(CacheKind::Produce, &fan.topic, fan.partition_id)
                        .evict_owner(evicted);
                }
            }
            fan.member_index = 0;
        }

        fan.members.push(member_id);
        let previous = fan.upstream.initial_id;
        let extension = fan.begin_extension();
        if let Some(upstream_id) = fan.upstream.do_begin_if_necessary(cx, fan.leader_id, extension) {
            self.fans_by_upstream.remove(&previous);
            self.fans_by_upstream.insert(upstream_id, fan_id);
        }

        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        if fan.upstream.state.initial_opened() {
            member.do_initial_window_if_necessary(cx);
        }
        if fan.upstream.state.reply_opening() && !fan.upstream.state.reply_closed() {
            member
                .stream
                .do_reply_begin_if_necessary(cx, member.extension.clone());
        }
    }

    fn do_fan_initial_data_if_necessary(&mut self, cx: &mut Context<'_>, fan_id: u64) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        let mut drained = Vec::new();
        let count = fan.members.len() as i64;
        let mut members_not_progressing: i64 = 0;
        while members_not_progressing < count {
            if fan.member_index >= fan.members.len() {
                fan.member_index = 0;
            }
            let member_id = fan.members[fan.member_index];
            let Some(member) = self.members.get_mut(&member_id) else {
                break;
            };
            let cursor = member.cursor;
            do_produce_initial_data(cx, fan, member);
            if member.message_offset != 0 {
                break;
            }
            if member.is_drained() && !drained.contains(&member_id) {
                drained.push(member_id);
            }
            fan.member_index += 1;
            if member.cursor > cursor {
                members_not_progressing = -1;
            }
            members_not_progressing += 1;
        }

        for member_id in drained {
            if let Some(member) = self.members.get_mut(&member_id) {
                member.stream.do_reply_end_if_necessary(cx);
            }
            self.on_member_closed(cx, member_id);
        }
    }

    fn on_member_closed(&mut self, cx: &mut Context<'_>, member_id: u64) {
        let Some(member) = self.members.remove(&member_id) else {
            return;
        };
        let Some(fan) = self.fans.get_mut(&member.fan_id) else {
            return;
        };
        if let Some(index) = fan.members.iter().position(|id| *id == member_id) {
            fan.members.remove(index);
            if index < fan.member_index {
                fan.member_index -= 1;
            }
        }
        cx.cache()
            .partition_mut(CacheKind::Produce, &fan.topic, fan.partition_id)
            .evict_owner(member_id);

        if fan.members.is_empty() {
            fan.reconnect.cancel(cx);
            if fan.initial_flags != 0 {
                // a record is only partly forwarded
                fan.upstream.do_initial_abort_if_necessary(cx);
            } else {
                fan.upstream.do_initial_end_if_necessary(cx);
            }
            fan.upstream.state.close_reply();
            let fan_id = fan.fan_id;
            self.remove_fan(fan_id);
        }
    }

    fn remove_fan(&mut self, fan_id: u64) {
        if let Some(fan) = self.fans.remove(&fan_id) {
            self.fans_by_key.remove(&(fan.topic, fan.partition_id));
            self.fans_by_upstream.remove(&fan.upstream.initial_id);
            debug!("produce fan {} closed", fan_id);
        }
    }

    // ------------------------------------------------------------------
    // Member streams
    // ------------------------------------------------------------------

    fn on_member_frame(&mut self, cx: &mut Context<'_>, member_id: u64, frame: Frame) {
        match frame {
            Frame::Data(data) => self.on_member_data(cx, member_id, data),
            Frame::Flush(_) => {
                if let Some(fan_id) = self.members.get(&member_id).map(|m| m.fan_id) {
                    self.do_fan_initial_data_if_necessary(cx, fan_id);
                }
            }
            Frame::End(_) => {
                let Some(member) = self.members.get_mut(&member_id) else {
                    return;
                };
                member.stream.state.close_initial();
                member.assembly = None;
                if member.is_drained() {
                    member.stream.do_reply_end_if_necessary(cx);
                    self.on_member_closed(cx, member_id);
                }
            }
            Frame::Abort(_) => {
                if let Some(member) = self.members.get_mut(&member_id) {
                    member.stream.state.close_initial();
                    member.stream.do_reply_abort_if_necessary(cx);
                }
                self.on_member_closed(cx, member_id);
            }
            Frame::Window(window) => {
                let Some(member) = self.members.get_mut(&member_id) else {
                    return;
                };
                if let Err(e) = member.stream.on_reply_window(&window) {
                    warn!("produce member {} window rejected: {}", member_id, e);
                    member.stream.cleanup(cx, 0);
                    self.on_member_closed(cx, member_id);
                }
            }
            Frame::Reset(_) => {
                if let Some(member) = self.members.get_mut(&member_id) {
                    member.stream.state.close_reply();
                    member.stream.do_initial_reset_if_necessary(cx, 0);
                }
                self.on_member_closed(cx, member_id);
            }
            Frame::Begin(_) | Frame::Signal(_) => {}
        }
    }

    fn on_member_data(&mut self, cx: &mut Context<'_>, member_id: u64, data: Data) {
        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        let fan_id = member.fan_id;
        if let Err(e) = member
            .stream
            .initial
            .on_data(data.header.sequence, data.reserved)
        {
            warn!("produce member {} data rejected: {}", member_id, e);
            member.stream.cleanup(cx, 0);
            self.on_member_closed(cx, member_id);
            return;
        }

        if data.is_init() {
            let Some(KafkaDataEx::Produce {
                timestamp,
                key,
                headers,
                ..
            }) = &data.extension
            else {
                member.stream.cleanup(cx, 0);
                self.on_member_closed(cx, member_id);
                return;
            };
            member.assembly = Some(Assembly {
                entry: CacheEntry::new(-1, *timestamp, key.clone(), None)
                    .with_headers(headers.clone())
                    .with_owner(member_id),
                value: None,
                reserved: 0,
            });
        }

        let Some(assembly) = member.assembly.as_mut() else {
            member.stream.cleanup(cx, 0);
            self.on_member_closed(cx, member_id);
            return;
        };
        if let Some(payload) = &data.payload {
            assembly
                .value
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(payload);
        }
        assembly.reserved += data.reserved as i64;
        member.unacked += data.reserved as i64;

        if data.is_fin() {
            let assembly = member.assembly.take();
            if let (Some(mut assembly), Some(fan)) = (assembly, self.fans.get(&fan_id)) {
                let mut entry = assembly.entry;
                entry.value = assembly.value.take().map(BytesMut::freeze);
                let position = cx
                    .cache()
                    .partition_mut(CacheKind::Produce, &fan.topic, fan.partition_id)
                    .append(entry);
                member.undelivered.push_back(assembly.reserved);
                trace!("produce member {} queued record at {}", member_id, position);
            }
        }

        self.do_fan_initial_data_if_necessary(cx, fan_id);
    }

    // ------------------------------------------------------------------
    // Upstream
    // ------------------------------------------------------------------

    fn on_upstream_frame(&mut self, cx: &mut Context<'_>, fan_id: u64, frame: Frame) {
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
            Frame::Flush(flush) => {
                let extension = flush.extension.filter(|ex| matches!(ex, KafkaFlushEx::Produce { .. }));
                for member_id in &fan.members {
                    if let Some(member) = self.members.get_mut(member_id) {
                        member.stream.do_reply_flush(cx, extension.clone());
                    }
                }
            }
            Frame::Data(_) => trace!("produce fan {} ignoring upstream data", fan_id),
            Frame::End(_) | Frame::Abort(_) => {
                let aborted = matches!(frame, Frame::Abort(_));
                fan.upstream.state.close_reply();
                if aborted {
                    fan.upstream.do_initial_abort_if_necessary(cx);
                } else {
                    fan.upstream.do_initial_end_if_necessary(cx);
                }
                fan.reconnect.cancel(cx);
                for member_id in std::mem::take(&mut fan.members) {
                    if let Some(mut member) = self.members.remove(&member_id) {
                        if aborted {
                            member.stream.do_reply_abort_if_necessary(cx);
                        } else {
                            member.stream.do_reply_end_if_necessary(cx);
                        }
                        member.stream.do_initial_reset_if_necessary(cx, 0);
                    }
                }
                self.remove_fan(fan_id);
            }
            Frame::Window(window) => {
                if let Err(e) = fan.upstream.on_initial_window(&window) {
                    warn!("produce fan {} window rejected: {}", fan_id, e);
                    fan.upstream.do_initial_abort_if_necessary(cx);
                    self.on_upstream_failed(cx, fan_id, 0);
                    return;
                }
                fan.reconnect.reset();
                for member_id in &fan.members {
                    if let Some(member) = self.members.get_mut(member_id) {
                        member.do_initial_window_if_necessary(cx);
                    }
                }
                self.do_fan_initial_data_if_necessary(cx, fan_id);
            }
            Frame::Reset(reset) => self.on_upstream_failed(cx, fan_id, reset.error()),
            Frame::Signal(_) => {}
        }
    }

    /// Closes what is left of a failed upstream, then reconnects or fails
    /// every member with `error`.
    fn on_upstream_failed(&mut self, cx: &mut Context<'_>, fan_id: u64, error: i32) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        fan.upstream.on_initial_closed();
        fan.upstream.do_reply_reset_if_necessary(cx);
        fan.initial_flags = 0;
        for member_id in &fan.members {
            if let Some(member) = self.members.get_mut(member_id) {
                member.message_offset = 0;
            }
        }

        if is_reconnectable(error) && fan.reconnect.is_enabled() && !fan.members.is_empty() {
            fan.reconnect.schedule(cx, fan_id);
            return;
        }
        debug!("produce fan {} failed with error {}", fan_id, error);
        fan.reconnect.cancel(cx);
        for member_id in std::mem::take(&mut fan.members) {
            if let Some(mut member) = self.members.remove(&member_id) {
                member.stream.cleanup(cx, error);
                cx.cache()
                    .partition_mut(CacheKind::Produce, &fan.topic, fan.partition_id)
                    .evict_owner(member_id);
            }
        }
        self.remove_fan(fan_id);
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, signal: Signal) {
        let fan_id = signal.header.stream_id;
        if signal.signal_id != SIGNAL_RECONNECT {
            trace!("produce fan {} ignoring signal {}", fan_id, signal.signal_id);
            return;
        }
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        fan.reconnect.fired();
        if fan.members.is_empty() {
            return;
        }
        let previous = fan.upstream.initial_id;
        let extension = fan.begin_extension();
        if let Some(upstream_id) = fan.upstream.do_begin_if_necessary(cx, fan.leader_id, extension) {
            self.fans_by_upstream.remove(&previous);
            self.fans_by_upstream.insert(upstream_id, fan_id);
        }
    }
}

impl StreamFactory for ProduceFanFactory {
    fn kinds(&self) -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Produce)]
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
        let member_id = begin.header.stream_id;
        if !is_initial(member_id) || self.members.contains_key(&member_id) {
            return false;
        }
        let Some(extension) = begin.extension.kafka() else {
            return false;
        };
        let KafkaBeginEx::Produce {
            transaction,
            topic,
            partition,
        } = extension
        else {
            return false;
        };

        let fan_id = self.supply_fan(cx, begin, transaction, topic, partition.partition_id);
        let cursor = cx
            .cache()
            .partition_mut(CacheKind::Produce, topic, partition.partition_id)
            .tail();
        self.members.insert(
            member_id,
            ProduceMember {
                stream: MemberStream::new(begin),
                fan_id,
                extension: extension.clone(),
                cursor,
                message_offset: 0,
                assembly: None,
                undelivered: VecDeque::new(),
                unacked: 0,
            },
        );
        self.on_member_opening(cx, fan_id, member_id);
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        if let Frame::Signal(signal) = frame {
            self.on_signal(cx, signal);
            return;
        }
        let initial_id = frame.stream_id() | 1;
        if let Some(fan_id) = self.fans_by_upstream.get(&initial_id).copied() {
            self.on_upstream_frame(cx, fan_id, frame);
        } else if self.members.contains_key(&initial_id) {
            self.on_member_frame(cx, initial_id, frame);
        } else {
            trace!("produce fan dropped {} for {}", frame.name(), frame.stream_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, ManualClock, CACHE_BINDING};
    use crate::config::GatewayConfig;
    use crate::fan::testing::{engine, engine_with, window};
    use crate::frame::{reply_id, BeginEx, End, FrameHeader, FLAGS_COMPLETE};
    use std::sync::Arc;

    fn produce_begin(stream_id: u64, affinity: u64) -> Frame {
        Frame::Begin(Begin {
            header: FrameHeader::new(0, CACHE_BINDING, stream_id),
            affinity,
            extension: BeginEx::Kafka(KafkaBeginEx::Produce {
                transaction: None,
                topic: "events".to_string(),
                partition: KafkaOffset::new(0, OFFSET_LATEST),
            }),
        })
    }

    fn record(stream_id: u64, sequence: i64, value: &'static [u8]) -> Frame {
        Frame::Data(Data {
            header: FrameHeader::new(0, CACHE_BINDING, stream_id).window(sequence, 0, 0),
            flags: FLAGS_COMPLETE,
            budget_id: 0,
            reserved: value.len() as i32,
            payload: Some(Bytes::from_static(value)),
            extension: Some(KafkaDataEx::Produce {
                deferred: 0,
                timestamp: 1_000,
                key: None,
                headers: Vec::new(),
            }),
        })
    }

    fn setup() -> (Engine, Arc<ManualClock>) {
        engine(Box::new(ProduceFanFactory::new()))
    }

    fn upstream_begins(frames: &[Frame]) -> Vec<(u64, u64)> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Begin(begin) if begin.header.origin_id == CACHE_BINDING => {
                    Some((begin.header.stream_id, begin.affinity))
                }
                _ => None,
            })
            .collect()
    }

    fn upstream_payloads(frames: &[Frame], upstream_id: u64) -> Vec<(u8, Bytes)> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) if data.header.stream_id == upstream_id => {
                    Some((data.flags, data.payload.clone().unwrap_or_default()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_members_share_one_upstream() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        engine.on_external(produce_begin(3, 7));

        let outbound = engine.drain_outbound();
        let begins = upstream_begins(&outbound);
        assert_eq!(begins.len(), 1);
        let upstream_id = begins[0].0;

        engine.on_external(Frame::End(End {
            header: FrameHeader::new(0, CACHE_BINDING, 1),
        }));
        assert!(!engine
            .drain_outbound()
            .iter()
            .any(|f| matches!(f, Frame::End(e) if e.header.stream_id == upstream_id)));

        engine.on_external(Frame::End(End {
            header: FrameHeader::new(0, CACHE_BINDING, 3),
        }));
        let ends: Vec<_> = engine
            .drain_outbound()
            .into_iter()
            .filter(|f| matches!(f, Frame::End(e) if e.header.stream_id == upstream_id))
            .collect();
        assert_eq!(ends.len(), 1);
    }

    #[test]
    fn test_round_robin_restarts_on_progress() {
        let (mut engine, _) = setup();
        for member in [1, 3, 5] {
            engine.on_external(produce_begin(member, 7));
        }
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(upstream_id, 0, 10, 0));
        engine.drain_outbound();

        engine.on_external(record(1, 0, b"aaaaaaaaaa"));
        engine.on_external(record(3, 0, b"bbbbbbbbbb"));
        engine.on_external(record(5, 0, b"cccccccccc"));
        engine.on_external(record(1, 10, b"dddddddddd"));
        for acknowledge in [10, 20, 30] {
            engine.on_external(window(upstream_id, acknowledge, 10, 0));
        }

        let payloads: Vec<_> = upstream_payloads(&engine.drain_outbound(), upstream_id)
            .into_iter()
            .map(|(_, payload)| payload[0])
            .collect();
        assert_eq!(payloads, vec![b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn test_records_fragment_to_window() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(upstream_id, 0, 4, 0));
        engine.on_external(record(1, 0, b"abcdefghij"));
        engine.on_external(window(upstream_id, 4, 4, 0));
        engine.on_external(window(upstream_id, 8, 4, 0));

        let fragments = upstream_payloads(&engine.drain_outbound(), upstream_id);
        assert_eq!(
            fragments,
            vec![
                (FLAG_INIT, Bytes::from_static(b"abcd")),
                (0, Bytes::from_static(b"efgh")),
                (FLAG_FIN, Bytes::from_static(b"ij")),
            ]
        );
    }

    #[test]
    fn test_leader_change_evicts_members() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        let first = upstream_begins(&engine.drain_outbound())[0].0;

        engine.on_external(produce_begin(3, 8));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == first)));
        assert!(outbound.iter().any(|f| matches!(f,
            Frame::Reset(r) if r.header.stream_id == 1
                && r.error() == KafkaErrorCode::NotLeaderForPartition.as_i32())));
        let begins = upstream_begins(&outbound);
        assert_eq!(begins.len(), 1);
        assert_ne!(begins[0].0, first);
        assert_eq!(begins[0].1, 8);
    }

    #[test]
    fn test_late_joiner_gets_window_and_begin() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(upstream_id, 0, 64, 0));
        engine.on_external(Frame::Begin(Begin {
            header: FrameHeader::new(CACHE_BINDING, 2, reply_id(upstream_id)),
            affinity: 7,
            extension: BeginEx::None,
        }));
        engine.drain_outbound();

        engine.on_external(produce_begin(3, 7));
        let outbound = engine.drain_outbound();
        assert!(outbound.iter().any(|f| matches!(f,
            Frame::Window(w) if w.header.stream_id == 3 && w.header.maximum == 64 * 1024)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Begin(b) if b.header.stream_id == reply_id(3))));
    }

    #[test]
    fn test_retryable_reset_reconnects_with_backoff() {
        let (mut engine, clock) = setup();
        engine.on_external(produce_begin(1, 7));
        let first = upstream_begins(&engine.drain_outbound())[0].0;

        engine.on_external(Frame::Reset(crate::frame::Reset {
            header: FrameHeader::new(0, CACHE_BINDING, first),
            extension: Some(crate::frame::KafkaResetEx::new(0)),
        }));
        engine.drain_outbound();
        assert_eq!(engine.next_deadline(), Some(1_050));

        clock.advance(50);
        engine.poll();
        let begins = upstream_begins(&engine.drain_outbound());
        assert_eq!(begins.len(), 1);
        assert_ne!(begins[0].0, first);
        assert_eq!(engine.metrics().snapshot().reconnects_scheduled, 1);
    }

    #[test]
    fn test_fatal_reset_fails_members() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(Frame::Reset(crate::frame::Reset {
            header: FrameHeader::new(0, CACHE_BINDING, upstream_id),
            extension: Some(crate::frame::KafkaResetEx::new(29)),
        }));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 29)));
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn test_retreating_upstream_window_reconnects() {
        let (mut engine, clock) = setup();
        engine.on_external(produce_begin(1, 7));
        let first = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(first, 0, 100, 0));
        engine.drain_outbound();

        engine.on_external(window(first, 0, 50, 0));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == first)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == reply_id(first))));
        assert!(!outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1)));
        assert_eq!(engine.next_deadline(), Some(1_050));

        clock.advance(50);
        engine.poll();
        let begins = upstream_begins(&engine.drain_outbound());
        assert_eq!(begins.len(), 1);
        assert_ne!(begins[0].0, first);
    }

    #[test]
    fn test_retreating_upstream_window_fails_members_without_reconnect() {
        let config = GatewayConfig::default().with_reconnect_secs(0);
        let (mut engine, _) = engine_with(config, Box::new(ProduceFanFactory::new()));
        engine.on_external(produce_begin(1, 7));
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(upstream_id, 0, 100, 0));
        engine.on_external(window(upstream_id, 0, 50, 0));

        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == upstream_id)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 0)));
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn test_retreating_member_sequence_resets_member() {
        let (mut engine, _) = setup();
        engine.on_external(produce_begin(1, 7));
        let upstream_id = upstream_begins(&engine.drain_outbound())[0].0;
        engine.on_external(window(upstream_id, 0, 64, 0));
        engine.on_external(record(1, 0, b"aaaa"));
        engine.drain_outbound();

        engine.on_external(record(1, 0, b"bbbb"));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 0)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::End(e) if e.header.stream_id == upstream_id)));
        assert!(upstream_payloads(&outbound, upstream_id).is_empty());
    }
}
