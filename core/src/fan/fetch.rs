//! Fetch fan: every consumer of one topic partition reads from a single
//! upstream fetch stream.
//!
//! Upstream records are appended to the partition cache and acknowledged at
//! once; each member streams them from its own cursor within its own reply
//! window, so a slow member never holds back the others. A lost upstream is
//! reopened with backoff from the offset after the last cached record.

use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::{MemberStream, Reconnect, Upstream, SIGNAL_RECONNECT};
use crate::cache::{CacheEntry, CacheKind, OFFSET_LATEST};
use crate::engine::{BindingKind, Context, StreamFactory};
use crate::frame::{
    is_initial, Begin, Data, Frame, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaKind,
    KafkaOffset, Signal, FLAGS_COMPLETE,
};
use crate::protocol::kafka::KafkaErrorCode;

#[derive(Debug)]
struct FetchMember {
    stream: MemberStream,
    fan_id: u64,
    /// Offset requested by the member, `OFFSET_EARLIEST` or `OFFSET_LATEST`.
    offset: i64,
    cursor: u64,
}

impl FetchMember {
    fn reply_extension(&self, fan: &FetchFan) -> KafkaBeginEx {
        let mut partition = KafkaOffset::new(fan.partition_id, self.offset);
        partition.latest_offset = fan.high_watermark;
        KafkaBeginEx::Fetch {
            topic: fan.topic.clone(),
            partition,
        }
    }

    /// Sends cached records from the member cursor while its window allows.
    fn do_reply_data_if_necessary(&mut self, cx: &mut Context<'_>, fan: &FetchFan) {
        if !self.stream.is_reply_open() || !self.stream.state.reply_opened() {
            return;
        }
        loop {
            let next = cx
                .cache()
                .partition(CacheKind::Fetch, &fan.topic, fan.partition_id)
                .and_then(|partition| partition.next(self.cursor))
                .map(|(position, entry)| (position, entry.clone()));
            let Some((position, entry)) = next else {
                break;
            };
            if self.offset >= 0 && entry.offset < self.offset {
                self.cursor = position + 1;
                continue;
            }
            let reserved = entry.size() as i64 + self.stream.reply.padding as i64;
            if reserved > self.stream.reply.budget() as i64 {
                break;
            }

            let mut partition = KafkaOffset::new(fan.partition_id, entry.offset);
            partition.latest_offset = fan.high_watermark;
            self.stream.do_reply_data(
                cx,
                FLAGS_COMPLETE,
                reserved as i32,
                entry.value,
                Some(KafkaDataEx::Fetch {
                    deferred: 0,
                    timestamp: entry.timestamp,
                    partition,
                    key: entry.key,
                    headers: entry.headers,
                }),
            );
            self.cursor = position + 1;
        }
    }
}

#[derive(Debug)]
struct FetchFan {
    fan_id: u64,
    topic: String,
    partition_id: i32,
    leader_id: u64,
    start_offset: i64,
    high_watermark: i64,
    members: Vec<u64>,
    upstream: Upstream,
    reconnect: Reconnect,
}

impl FetchFan {
    /// Offset to fetch from: after the last cached record, else where the
    /// first member asked to start.
    fn resume_offset(&self, cx: &mut Context<'_>) -> i64 {
        cx.cache()
            .partition(CacheKind::Fetch, &self.topic, self.partition_id)
            .and_then(|partition| partition.next_offset())
            .unwrap_or(self.start_offset)
    }

    fn do_upstream_begin_if_necessary(&mut self, cx: &mut Context<'_>) -> Option<u64> {
        let offset = self.resume_offset(cx);
        let extension = KafkaBeginEx::Fetch {
            topic: self.topic.clone(),
            partition: KafkaOffset::new(self.partition_id, offset),
        };
        self.upstream
            .do_begin_if_necessary(cx, self.leader_id, extension)
    }
}

/// Fans fetch streams out of one upstream per topic partition.
#[derive(Default)]
pub struct FetchFanFactory {
    fans: HashMap<u64, FetchFan>,
    fans_by_key: HashMap<(String, i32), u64>,
    fans_by_upstream: HashMap<u64, u64>,
    members: HashMap<u64, FetchMember>,
    next_fan_id: u64,
}

impl FetchFanFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fan_count(&self) -> usize {
        self.fans.len()
    }

    fn supply_fan(
        &mut self,
        cx: &mut Context<'_>,
        begin: &Begin,
        topic: &str,
        offset: i64,
        partition_id: i32,
    ) -> u64 {
        let key = (topic.to_string(), partition_id);
        if let Some(fan_id) = self.fans_by_key.get(&key) {
            return *fan_id;
        }
        self.next_fan_id += 1;
        let fan_id = self.next_fan_id;
        // a new fan starts from an empty cache
        cx.cache().remove(CacheKind::Fetch, topic, partition_id);
        let max_delay_ms = cx.config().reconnect_max_delay_ms();
        self.fans.insert(
            fan_id,
            FetchFan {
                fan_id,
                topic: topic.to_string(),
                partition_id,
                leader_id: begin.affinity,
                start_offset: offset,
                high_watermark: OFFSET_LATEST,
                members: Vec::new(),
                upstream: Upstream::default(),
                reconnect: Reconnect::new(max_delay_ms),
            },
        );
        self.fans_by_key.insert(key, fan_id);
        debug!("fetch fan {} opened for {}-{}", fan_id, topic, partition_id);
        fan_id
    }

    fn on_member_opening(&mut self, cx: &mut Context<'_>, fan_id: u64, member_id: u64) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        let affinity = self.members.get(&member_id).map_or(0, |m| m.stream.affinity);

        if affinity != fan.leader_id {
            debug!(
                "fetch fan {} leader {} replaced by {}",
                fan_id, fan.leader_id, affinity
            );
            fan.reconnect.cancel(cx);
            fan.upstream.do_initial_abort_if_necessary(cx);
            fan.upstream.do_reply_reset_if_necessary(cx);
            fan.leader_id = affinity;
            for evicted in std::mem::take(&mut fan.members) {
                if let Some(mut member) = self.members.remove(&evicted) {
                    member
                        .stream
                        .cleanup(cx, KafkaErrorCode::NotLeaderForPartition.as_i32());
                }
            }
        }

        fan.members.push(member_id);
        let previous = fan.upstream.initial_id;
        if let Some(upstream_id) = fan.do_upstream_begin_if_necessary(cx) {
            self.fans_by_upstream.remove(&previous);
            self.fans_by_upstream.insert(upstream_id, fan_id);
        }
        if fan.upstream.state.reply_opening() && !fan.upstream.state.reply_closed() {
            if let Some(member) = self.members.get_mut(&member_id) {
                let extension = member.reply_extension(fan);
                member.stream.do_reply_begin_if_necessary(cx, extension);
            }
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
            fan.reconnect.cancel(cx);
            fan.upstream.do_initial_end_if_necessary(cx);
            fan.upstream.state.close_reply();
            let fan_id = fan.fan_id;
            self.remove_fan(fan_id);
        }
    }

    fn remove_fan(&mut self, fan_id: u64) {
        if let Some(fan) = self.fans.remove(&fan_id) {
            self.fans_by_key.remove(&(fan.topic, fan.partition_id));
            self.fans_by_upstream.remove(&fan.upstream.initial_id);
            debug!("fetch fan {} closed", fan_id);
        }
    }

    fn on_member_frame(&mut self, cx: &mut Context<'_>, member_id: u64, frame: Frame) {
        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        match frame {
            Frame::Window(window) => {
                if let Err(e) = member.stream.on_reply_window(&window) {
                    warn!("fetch member {} window rejected: {}", member_id, e);
                    member.stream.cleanup(cx, 0);
                    self.on_member_closed(cx, member_id);
                    return;
                }
                if let Some(fan) = self.fans.get(&member.fan_id) {
                    member.do_reply_data_if_necessary(cx, fan);
                }
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

    fn on_upstream_data(&mut self, cx: &mut Context<'_>, fan_id: u64, data: Data) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        if let Err(e) = fan
            .upstream
            .reply
            .on_data(data.header.sequence, data.reserved)
        {
            warn!("fetch fan {} data rejected: {}", fan_id, e);
            fan.upstream.do_initial_abort_if_necessary(cx);
            self.on_upstream_failed(cx, fan_id, 0);
            return;
        }

        match data.extension {
            Some(KafkaDataEx::Fetch {
                timestamp,
                partition,
                key,
                headers,
                ..
            }) => {
                if partition.latest_offset > fan.high_watermark {
                    fan.high_watermark = partition.latest_offset;
                }
                let entry =
                    CacheEntry::new(partition.partition_offset, timestamp, key, data.payload)
                        .with_headers(headers);
                cx.cache()
                    .partition_mut(CacheKind::Fetch, &fan.topic, fan.partition_id)
                    .append(entry);
            }
            _ => trace!("fetch fan {} data without record metadata", fan_id),
        }

        let maximum = cx.config().slot_capacity as i32;
        fan.upstream.do_reply_window_if_necessary(cx, maximum);
        for member_id in &fan.members {
            if let Some(member) = self.members.get_mut(member_id) {
                member.do_reply_data_if_necessary(cx, fan);
            }
        }
    }

    fn on_upstream_frame(&mut self, cx: &mut Context<'_>, fan_id: u64, frame: Frame) {
        if let Frame::Data(data) = frame {
            self.on_upstream_data(cx, fan_id, data);
            return;
        }
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        match frame {
            Frame::Begin(_) => {
                fan.upstream.state.open_reply();
                for member_id in &fan.members {
                    if let Some(member) = self.members.get_mut(member_id) {
                        let extension = member.reply_extension(fan);
                        member.stream.do_reply_begin_if_necessary(cx, extension);
                    }
                }
                let maximum = cx.config().slot_capacity as i32;
                fan.upstream.do_reply_window_if_necessary(cx, maximum);
            }
            Frame::Flush(flush) => {
                if let Some(KafkaFlushEx::Fetch { partition }) = &flush.extension {
                    fan.high_watermark = fan.high_watermark.max(partition.latest_offset);
                }
            }
            Frame::End(_) | Frame::Abort(_) => {
                fan.upstream.state.close_reply();
                if matches!(frame, Frame::Abort(_)) {
                    fan.upstream.do_initial_abort_if_necessary(cx);
                } else {
                    fan.upstream.do_initial_end_if_necessary(cx);
                }
                if !fan.members.is_empty() && fan.reconnect.is_enabled() {
                    fan.reconnect.schedule(cx, fan_id);
                } else {
                    self.fail_members(cx, fan_id, 0);
                }
            }
            Frame::Window(window) => {
                if let Err(e) = fan.upstream.on_initial_window(&window) {
                    warn!("fetch fan {} window rejected: {}", fan_id, e);
                    fan.upstream.do_initial_abort_if_necessary(cx);
                    self.on_upstream_failed(cx, fan_id, 0);
                    return;
                }
                fan.reconnect.reset();
            }
            Frame::Reset(reset) => self.on_upstream_failed(cx, fan_id, reset.error()),
            Frame::Data(_) | Frame::Signal(_) => {}
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
        let not_leader = error == KafkaErrorCode::NotLeaderForPartition.as_i32();
        if !not_leader && fan.reconnect.is_enabled() && !fan.members.is_empty() {
            fan.reconnect.schedule(cx, fan_id);
            return;
        }
        if not_leader {
            debug!("fetch fan {} lost partition leadership", fan_id);
        }
        self.fail_members(cx, fan_id, error);
    }

    fn fail_members(&mut self, cx: &mut Context<'_>, fan_id: u64, error: i32) {
        let Some(fan) = self.fans.get_mut(&fan_id) else {
            return;
        };
        fan.reconnect.cancel(cx);
        for member_id in std::mem::take(&mut fan.members) {
            if let Some(mut member) = self.members.remove(&member_id) {
                member.stream.cleanup(cx, error);
            }
        }
        self.remove_fan(fan_id);
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, signal: Signal) {
        let fan_id = signal.header.stream_id;
        if signal.signal_id != SIGNAL_RECONNECT {
            trace!("fetch fan {} ignoring signal {}", fan_id, signal.signal_id);
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
        if let Some(upstream_id) = fan.do_upstream_begin_if_necessary(cx) {
            self.fans_by_upstream.remove(&previous);
            self.fans_by_upstream.insert(upstream_id, fan_id);
        }
    }
}

impl StreamFactory for FetchFanFactory {
    fn kinds(&self) -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Fetch)]
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
        let member_id = begin.header.stream_id;
        if !is_initial(member_id) || self.members.contains_key(&member_id) {
            return false;
        }
        let Some(KafkaBeginEx::Fetch { topic, partition }) = begin.extension.kafka() else {
            return false;
        };

        let offset = partition.partition_offset;
        let fan_id = self.supply_fan(cx, begin, topic, offset, partition.partition_id);
        let cursor = cx
            .cache()
            .partition_mut(CacheKind::Fetch, topic, partition.partition_id)
            .seek(offset);
        self.members.insert(
            member_id,
            FetchMember {
                stream: MemberStream::new(begin),
                fan_id,
                offset,
                cursor,
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
            trace!("fetch fan dropped {} for {}", frame.name(), frame.stream_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OFFSET_EARLIEST;
    use crate::engine::{Clock, Engine, ManualClock, CACHE_BINDING};
    use crate::config::GatewayConfig;
    use crate::fan::testing::{engine, engine_with, window};
    use crate::frame::{reply_id, BeginEx, End, FrameHeader, KafkaResetEx, Reset};
    use bytes::Bytes;
    use std::sync::Arc;

    fn fetch_begin(stream_id: u64, offset: i64) -> Frame {
        fetch_begin_from(stream_id, offset, 7)
    }

    fn fetch_begin_from(stream_id: u64, offset: i64, affinity: u64) -> Frame {
        Frame::Begin(Begin {
            header: FrameHeader::new(0, CACHE_BINDING, stream_id),
            affinity,
            extension: BeginEx::Kafka(KafkaBeginEx::Fetch {
                topic: "events".to_string(),
                partition: KafkaOffset::new(0, offset),
            }),
        })
    }

    fn upstream_begin(frames: &[Frame]) -> Option<(u64, i64)> {
        frames.iter().find_map(|frame| match frame {
            Frame::Begin(Begin {
                header,
                extension: BeginEx::Kafka(KafkaBeginEx::Fetch { partition, .. }),
                ..
            }) if header.origin_id == CACHE_BINDING => {
                Some((header.stream_id, partition.partition_offset))
            }
            _ => None,
        })
    }

    fn open_upstream(engine: &mut Engine, upstream_id: u64) {
        engine.on_external(Frame::Begin(Begin {
            header: FrameHeader::new(CACHE_BINDING, 2, reply_id(upstream_id)),
            affinity: 7,
            extension: BeginEx::None,
        }));
    }

    fn upstream_record(
        upstream_id: u64,
        sequence: i64,
        offset: i64,
        value: &'static [u8],
    ) -> Frame {
        let mut partition = KafkaOffset::new(0, offset);
        partition.latest_offset = 10;
        Frame::Data(Data {
            header: FrameHeader::new(CACHE_BINDING, 2, reply_id(upstream_id))
                .window(sequence, 0, 0),
            flags: FLAGS_COMPLETE,
            budget_id: 0,
            reserved: value.len() as i32,
            payload: Some(Bytes::from_static(value)),
            extension: Some(KafkaDataEx::Fetch {
                deferred: 0,
                timestamp: 0,
                partition,
                key: None,
                headers: Vec::new(),
            }),
        })
    }

    fn member_offsets(frames: &[Frame], member_id: u64) -> Vec<i64> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Data(Data {
                    header,
                    extension: Some(KafkaDataEx::Fetch { partition, .. }),
                    ..
                }) if header.stream_id == reply_id(member_id) => Some(partition.partition_offset),
                _ => None,
            })
            .collect()
    }

    fn setup() -> (Engine, Arc<ManualClock>) {
        engine(Box::new(FetchFanFactory::new()))
    }

    #[test]
    fn test_members_read_within_own_windows() {
        let (mut engine, _) = setup();
        engine.on_external(fetch_begin(1, OFFSET_EARLIEST));
        engine.on_external(fetch_begin(3, OFFSET_EARLIEST));
        let (upstream_id, offset) = upstream_begin(&engine.drain_outbound()).unwrap();
        assert_eq!(offset, OFFSET_EARLIEST);

        open_upstream(&mut engine, upstream_id);
        engine.on_external(window(reply_id(1), 0, 100, 0));
        engine.on_external(window(reply_id(3), 0, 5, 0));
        for (index, value) in [b"r0r0", b"r1r1", b"r2r2"].iter().enumerate() {
            let sequence = index as i64 * 4;
            engine.on_external(upstream_record(upstream_id, sequence, index as i64, *value));
        }

        let outbound = engine.drain_outbound();
        assert_eq!(member_offsets(&outbound, 1), vec![0, 1, 2]);
        assert_eq!(member_offsets(&outbound, 3), vec![0]);

        engine.on_external(window(reply_id(3), 4, 12, 0));
        assert_eq!(member_offsets(&engine.drain_outbound(), 3), vec![1, 2]);
    }

    #[test]
    fn test_late_joiner_reads_cached_records() {
        let (mut engine, _) = setup();
        engine.on_external(fetch_begin(1, OFFSET_EARLIEST));
        let (upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        open_upstream(&mut engine, upstream_id);
        engine.on_external(upstream_record(upstream_id, 0, 5, b"five"));
        engine.on_external(upstream_record(upstream_id, 4, 6, b"six!"));
        engine.drain_outbound();

        engine.on_external(fetch_begin(3, 6));
        let outbound = engine.drain_outbound();
        assert!(upstream_begin(&outbound).is_none());
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Begin(b) if b.header.stream_id == reply_id(3))));

        engine.on_external(window(reply_id(3), 0, 100, 0));
        assert_eq!(member_offsets(&engine.drain_outbound(), 3), vec![6]);
    }

    #[test]
    fn test_reconnects_after_last_cached_offset() {
        let (mut engine, clock) = setup();
        engine.on_external(fetch_begin(1, OFFSET_EARLIEST));
        let (upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        open_upstream(&mut engine, upstream_id);
        engine.on_external(upstream_record(upstream_id, 0, 41, b"v"));
        engine.on_external(Frame::End(End {
            header: FrameHeader::new(CACHE_BINDING, 2, reply_id(upstream_id)),
        }));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::End(e) if e.header.stream_id == upstream_id)));
        assert_eq!(engine.next_deadline(), Some(1_050));

        clock.advance(50);
        engine.poll();
        let (next_id, offset) = upstream_begin(&engine.drain_outbound()).unwrap();
        assert_ne!(next_id, upstream_id);
        assert_eq!(offset, 42);
    }

    #[test]
    fn test_backoff_grows_until_window() {
        let (mut engine, clock) = setup();
        engine.on_external(fetch_begin(1, OFFSET_LATEST));
        let (mut upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();

        let mut deadlines = Vec::new();
        for _ in 0..3 {
            engine.on_external(Frame::Reset(Reset {
                header: FrameHeader::new(0, CACHE_BINDING, upstream_id),
                extension: Some(KafkaResetEx::new(0)),
            }));
            let deadline = engine.next_deadline().unwrap();
            deadlines.push(deadline - clock.now_ms());
            clock.set(deadline);
            engine.poll();
            upstream_id = upstream_begin(&engine.drain_outbound()).unwrap().0;
        }
        assert_eq!(deadlines, vec![50, 100, 200]);

        engine.on_external(window(upstream_id, 0, 0, 0));
        engine.on_external(Frame::Reset(Reset {
            header: FrameHeader::new(0, CACHE_BINDING, upstream_id),
            extension: Some(KafkaResetEx::new(0)),
        }));
        assert_eq!(engine.next_deadline().unwrap() - clock.now_ms(), 50);
    }

    #[test]
    fn test_not_leader_fails_members() {
        let (mut engine, _) = setup();
        engine.on_external(fetch_begin(1, OFFSET_LATEST));
        let (upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        engine.on_external(Frame::Reset(Reset {
            header: FrameHeader::new(0, CACHE_BINDING, upstream_id),
            extension: Some(KafkaResetEx::new(6)),
        }));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 6)));
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn test_leader_change_evicts_members() {
        let (mut engine, _) = setup();
        engine.on_external(fetch_begin_from(1, OFFSET_LATEST, 7));
        let (first, _) = upstream_begin(&engine.drain_outbound()).unwrap();

        engine.on_external(fetch_begin_from(3, OFFSET_LATEST, 8));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == first)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == reply_id(first))));
        assert!(outbound.iter().any(|f| matches!(f,
            Frame::Reset(r) if r.header.stream_id == 1
                && r.error() == KafkaErrorCode::NotLeaderForPartition.as_i32())));
        assert!(!outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 3)));

        let leaders: Vec<(u64, u64)> = outbound
            .iter()
            .filter_map(|frame| match frame {
                Frame::Begin(begin) if begin.header.origin_id == CACHE_BINDING => {
                    Some((begin.header.stream_id, begin.affinity))
                }
                _ => None,
            })
            .collect();
        assert_eq!(leaders.len(), 1);
        assert_ne!(leaders[0].0, first);
        assert_eq!(leaders[0].1, 8);
    }

    #[test]
    fn test_retreating_upstream_window_reconnects() {
        let (mut engine, clock) = setup();
        engine.on_external(fetch_begin(1, OFFSET_LATEST));
        let (first, _) = upstream_begin(&engine.drain_outbound()).unwrap();
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
        let (next_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        assert_ne!(next_id, first);
    }

    #[test]
    fn test_retreating_upstream_data_resumes_after_cache() {
        let (mut engine, clock) = setup();
        engine.on_external(fetch_begin(1, OFFSET_EARLIEST));
        let (first, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        open_upstream(&mut engine, first);
        engine.on_external(upstream_record(first, 0, 41, b"v"));
        engine.drain_outbound();

        engine.on_external(upstream_record(first, 0, 42, b"w"));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == first)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == reply_id(first))));
        assert_eq!(engine.next_deadline(), Some(1_050));

        clock.advance(50);
        engine.poll();
        let (next_id, offset) = upstream_begin(&engine.drain_outbound()).unwrap();
        assert_ne!(next_id, first);
        assert_eq!(offset, 42);
    }

    #[test]
    fn test_retreating_member_window_resets_member() {
        let (mut engine, _) = setup();
        engine.on_external(fetch_begin(1, OFFSET_EARLIEST));
        let (upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        open_upstream(&mut engine, upstream_id);
        engine.on_external(window(reply_id(1), 0, 100, 0));
        engine.drain_outbound();

        engine.on_external(window(reply_id(1), 0, 50, 0));
        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 0)));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Abort(a) if a.header.stream_id == reply_id(1))));
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::End(e) if e.header.stream_id == upstream_id)));
    }

    #[test]
    fn test_lost_upstream_fails_members_without_reconnect() {
        let config = GatewayConfig::default().with_reconnect_secs(0);
        let (mut engine, _) = engine_with(config, Box::new(FetchFanFactory::new()));
        engine.on_external(fetch_begin(1, OFFSET_LATEST));
        let (upstream_id, _) = upstream_begin(&engine.drain_outbound()).unwrap();
        open_upstream(&mut engine, upstream_id);
        engine.on_external(Frame::End(End {
            header: FrameHeader::new(CACHE_BINDING, 2, reply_id(upstream_id)),
        }));

        let outbound = engine.drain_outbound();
        assert!(outbound
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 1 && r.error() == 0)));
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.stream_count(), 0);
    }
}
