//! # Fans
//!
//! A fan shares one upstream stream between every member stream that asks
//! for the same thing: produce and fetch fans are keyed by topic partition,
//! the consumer-group fan by group id. Members live only as long as their
//! application stream; the fan connects lazily on its first member and
//! closes its upstream once the last member leaves.
//!
//! Fans and their members are pinned to the engine shard that accepted the
//! first member. Records travel through the shard's
//! [`PartitionCache`](crate::cache::PartitionCache), each member reading
//! from its own cursor.

pub mod fetch;
pub mod group;
pub mod produce;

pub use fetch::FetchFanFactory;
pub use group::GroupFanFactory;
pub use produce::ProduceFanFactory;

use tracing::debug;

use crate::engine::{Context, CACHE_BINDING, CLIENT_BINDING};
use crate::flow::{FlowError, StreamState, StreamWindow};
use crate::frame::{
    reply_id, Begin, BeginEx, FrameHeader, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaResetEx,
    Window,
};
use crate::protocol::kafka::KafkaErrorCode;

/// Reconnect timer of a fan.
pub const SIGNAL_RECONNECT: i32 = 1;

const BASE_DELAY_MS: i64 = 50;

/// Exponential reconnect backoff, `min(50 << attempt, max_delay_ms)`.
/// A `max_delay_ms` of zero disables reconnecting.
#[derive(Debug, Clone)]
pub struct Reconnect {
    attempt: u32,
    max_delay_ms: i64,
    cancel_id: Option<u64>,
}

impl Reconnect {
    pub fn new(max_delay_ms: i64) -> Self {
        Self {
            attempt: 0,
            max_delay_ms: if max_delay_ms > 0 {
                max_delay_ms.max(BASE_DELAY_MS)
            } else {
                0
            },
            cancel_id: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_delay_ms > 0
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt.
    pub fn delay_ms(&self) -> i64 {
        BASE_DELAY_MS
            .checked_shl(self.attempt)
            .filter(|delay| *delay > 0 && *delay <= self.max_delay_ms)
            .unwrap_or(self.max_delay_ms)
    }

    pub fn is_scheduled(&self) -> bool {
        self.cancel_id.is_some()
    }

    /// Schedules the next attempt for `stream_id`, replacing a pending one.
    pub fn schedule(&mut self, cx: &mut Context<'_>, stream_id: u64) -> i64 {
        self.cancel(cx);
        let delay_ms = self.delay_ms();
        self.attempt = self.attempt.saturating_add(1);
        let deadline_ms = cx.now() + delay_ms;
        self.cancel_id = Some(cx.signal_at(deadline_ms, stream_id, SIGNAL_RECONNECT, 0));
        cx.metrics().record_reconnect();
        debug!("fan {} reconnecting in {}ms", stream_id, delay_ms);
        delay_ms
    }

    pub fn cancel(&mut self, cx: &mut Context<'_>) {
        if let Some(cancel_id) = self.cancel_id.take() {
            cx.cancel(cancel_id);
        }
    }

    /// The scheduled attempt fired.
    pub fn fired(&mut self) {
        self.cancel_id = None;
    }

    /// Upstream granted a window; the next failure starts from scratch.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Upstream failures a fan recovers from by reconnecting. `0` is a lost
/// connection.
pub fn is_reconnectable(error: i32) -> bool {
    error == 0
        || (error != KafkaErrorCode::NotLeaderForPartition.as_i32()
            && KafkaErrorCode::from_i16(error as i16).is_retriable())
}

/// Application stream attached to a fan.
#[derive(Debug)]
pub(crate) struct MemberStream {
    pub origin_id: u64,
    pub routed_id: u64,
    pub initial_id: u64,
    pub affinity: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub state: StreamState,
    pub initial: StreamWindow,
    pub reply: StreamWindow,
}

impl MemberStream {
    pub fn new(begin: &Begin) -> Self {
        let header = begin.header;
        let mut state = StreamState::new();
        state.open_initial();
        Self {
            origin_id: header.origin_id,
            routed_id: header.routed_id,
            initial_id: header.stream_id,
            affinity: begin.affinity,
            trace_id: header.trace_id,
            authorization: header.authorization,
            state,
            initial: StreamWindow::new(),
            reply: StreamWindow::new(),
        }
    }

    pub fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.initial_id)
            .window(
                self.initial.sequence,
                self.initial.acknowledge,
                self.initial.maximum,
            )
            .trace(self.trace_id, self.authorization)
    }

    pub fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, reply_id(self.initial_id))
            .window(self.reply.sequence, self.reply.acknowledge, self.reply.maximum)
            .trace(self.trace_id, self.authorization)
    }

    /// Credits the member up to `maximum`, leaving `unacked` outstanding.
    pub fn do_initial_window_if_necessary(
        &mut self,
        cx: &mut Context<'_>,
        unacked: i64,
        maximum: i32,
    ) {
        if self.state.initial_closed() {
            return;
        }
        let opened = self.state.initial_opened();
        if self.initial.compute_credit(unacked, maximum, opened).is_some() {
            self.state.opened_initial();
            cx.window(self.initial_header(), 0, 0, 0);
        }
    }

    pub fn do_initial_reset_if_necessary(&mut self, cx: &mut Context<'_>, error: i32) {
        if !self.state.initial_closed() {
            self.state.close_initial();
            cx.reset(self.initial_header(), Some(KafkaResetEx::new(error)));
        }
    }

    pub fn do_reply_begin_if_necessary(&mut self, cx: &mut Context<'_>, extension: KafkaBeginEx) {
        if !self.state.reply_opening() {
            self.state.open_reply();
            cx.begin(self.reply_header(), self.affinity, BeginEx::Kafka(extension));
        }
    }

    /// Whether the reply can carry frames.
    pub fn is_reply_open(&self) -> bool {
        self.state.reply_opening() && !self.state.reply_closed()
    }

    pub fn do_reply_data(
        &mut self,
        cx: &mut Context<'_>,
        flags: u8,
        reserved: i32,
        payload: Option<bytes::Bytes>,
        extension: Option<KafkaDataEx>,
    ) {
        cx.data(
            self.reply_header(),
            flags,
            self.reply.budget_id,
            reserved,
            payload,
            extension,
        );
        self.reply.sent(reserved);
    }

    pub fn do_reply_flush(&mut self, cx: &mut Context<'_>, extension: Option<KafkaFlushEx>) {
        if self.is_reply_open() {
            cx.flush(self.reply_header(), self.reply.budget_id, 0, extension);
        }
    }

    pub fn do_reply_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.is_reply_open() {
            cx.end(self.reply_header());
        }
        self.state.close_reply();
    }

    pub fn do_reply_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.is_reply_open() {
            cx.abort(self.reply_header());
        }
        self.state.close_reply();
    }

    pub fn on_reply_window(&mut self, window: &Window) -> Result<(), FlowError> {
        let header = window.header;
        self.reply.apply_window(
            header.acknowledge,
            header.maximum,
            window.padding,
            window.minimum,
            window.budget_id,
        )?;
        self.state.opened_reply();
        Ok(())
    }

    pub fn cleanup(&mut self, cx: &mut Context<'_>, error: i32) {
        self.do_initial_reset_if_necessary(cx, error);
        self.do_reply_abort_if_necessary(cx);
    }
}

/// Stream a fan opens towards the request clients.
#[derive(Debug, Default)]
pub(crate) struct Upstream {
    pub initial_id: u64,
    pub state: StreamState,
    pub initial: StreamWindow,
    pub reply: StreamWindow,
}

impl Upstream {
    pub fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(CACHE_BINDING, CLIENT_BINDING, self.initial_id).window(
            self.initial.sequence,
            self.initial.acknowledge,
            self.initial.maximum,
        )
    }

    pub fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(CACHE_BINDING, CLIENT_BINDING, reply_id(self.initial_id)).window(
            self.reply.sequence,
            self.reply.acknowledge,
            self.reply.maximum,
        )
    }

    /// Opens a fresh upstream unless one is already opening; returns the new
    /// initial id. A fully closed upstream starts over from zeroed counters.
    pub fn do_begin_if_necessary(
        &mut self,
        cx: &mut Context<'_>,
        affinity: u64,
        extension: KafkaBeginEx,
    ) -> Option<u64> {
        if self.state.closed() {
            self.state.reset();
            self.initial.reset();
            self.reply.reset();
        }
        if self.state.initial_opening() {
            return None;
        }
        self.initial_id = cx.supply_initial_id();
        self.state.open_initial();
        cx.begin(self.initial_header(), affinity, BeginEx::Kafka(extension));
        Some(self.initial_id)
    }

    pub fn is_initial_open(&self) -> bool {
        self.state.initial_opening() && !self.state.initial_closed()
    }

    pub fn on_initial_window(&mut self, window: &Window) -> Result<bool, FlowError> {
        let header = window.header;
        let opened = self.initial.apply_window(
            header.acknowledge,
            header.maximum,
            window.padding,
            window.minimum,
            window.budget_id,
        )?;
        let first = !self.state.initial_opened();
        self.state.opened_initial();
        Ok(opened || first)
    }

    /// Marks the initial closed and zeroes its counters.
    pub fn on_initial_closed(&mut self) {
        self.state.close_initial();
        self.initial.reset();
    }

    pub fn do_initial_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.is_initial_open() {
            cx.end(self.initial_header());
        }
        self.on_initial_closed();
    }

    pub fn do_initial_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.is_initial_open() {
            cx.abort(self.initial_header());
        }
        self.on_initial_closed();
    }

    pub fn do_reply_window_if_necessary(&mut self, cx: &mut Context<'_>, maximum: i32) {
        if !self.state.reply_opening() || self.state.reply_closed() {
            return;
        }
        let opened = self.state.reply_opened();
        if self.reply.compute_credit(0, maximum, opened).is_some() {
            self.state.opened_reply();
            cx.window(self.reply_header(), 0, 0, 0);
        }
    }

    pub fn do_reply_reset_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.initial_opening() && !self.state.reply_closed() {
            cx.reset(self.reply_header(), None);
        }
        self.state.close_reply();
    }
}
