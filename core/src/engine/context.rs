//! Handle given to a factory while it handles a frame.

use bytes::Bytes;

use super::{Endpoint, EngineCore, RouteResolver, SIGNAL_BUDGET_CREDITED};
use crate::cache::PartitionCache;
use crate::config::GatewayConfig;
use crate::flow::{BudgetCreditor, BudgetWatcher, SlotPool};
use crate::frame::{
    Abort, Begin, BeginEx, Data, End, Flush, Frame, FrameHeader, KafkaDataEx, KafkaFlushEx,
    KafkaResetEx, Reset, Window,
};
use crate::metrics::GatewayMetrics;

pub struct Context<'a> {
    core: &'a mut EngineCore,
    current: Endpoint,
}

impl<'a> Context<'a> {
    pub(super) fn new(core: &'a mut EngineCore, current: Endpoint) -> Self {
        Self { core, current }
    }

    fn owner(&self) -> usize {
        match self.current {
            Endpoint::Factory(index) => index,
            Endpoint::External => usize::MAX,
        }
    }

    pub fn now(&self) -> i64 {
        self.core.clock.now_ms()
    }

    pub fn shard(&self) -> usize {
        self.core.shard
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.core.config
    }

    pub fn routes(&self) -> &dyn RouteResolver {
        self.core.routes.as_ref()
    }

    pub fn creditor(&self) -> &BudgetCreditor {
        &self.core.creditor
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.core.metrics
    }

    pub fn decode_pool(&mut self) -> &mut SlotPool {
        &mut self.core.decode_pool
    }

    pub fn encode_pool(&mut self) -> &mut SlotPool {
        &mut self.core.encode_pool
    }

    pub fn cache(&mut self) -> &mut PartitionCache {
        &mut self.core.cache
    }

    /// Fresh odd stream id for a stream initiated by this shard.
    pub fn supply_initial_id(&mut self) -> u64 {
        let initial_id = self.core.next_stream_id;
        self.core.next_stream_id += 2;
        initial_id
    }

    pub fn supply_trace_id(&mut self) -> u64 {
        let trace_id = self.core.next_trace_id;
        self.core.next_trace_id += 1;
        trace_id
    }

    /// Queues a frame; it is delivered once the current handler returns.
    pub fn write(&mut self, frame: Frame) {
        self.core.pending.push_back((self.current, frame));
    }

    pub fn begin(&mut self, header: FrameHeader, affinity: u64, extension: BeginEx) {
        self.write(Frame::Begin(Begin {
            header,
            affinity,
            extension,
        }));
    }

    pub fn data(
        &mut self,
        header: FrameHeader,
        flags: u8,
        budget_id: u64,
        reserved: i32,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    ) {
        self.write(Frame::Data(Data {
            header,
            flags,
            budget_id,
            reserved,
            payload,
            extension,
        }));
    }

    pub fn end(&mut self, header: FrameHeader) {
        self.write(Frame::End(End { header }));
    }

    pub fn abort(&mut self, header: FrameHeader) {
        self.write(Frame::Abort(Abort { header }));
    }

    pub fn flush(
        &mut self,
        header: FrameHeader,
        budget_id: u64,
        reserved: i32,
        extension: Option<KafkaFlushEx>,
    ) {
        self.write(Frame::Flush(Flush {
            header,
            budget_id,
            reserved,
            extension,
        }));
    }

    pub fn window(&mut self, header: FrameHeader, budget_id: u64, padding: i32, minimum: i32) {
        self.write(Frame::Window(Window {
            header,
            budget_id,
            padding,
            minimum,
        }));
    }

    pub fn reset(&mut self, header: FrameHeader, extension: Option<KafkaResetEx>) {
        self.write(Frame::Reset(Reset { header, extension }));
    }

    /// Schedules a signal back to the current factory.
    pub fn signal_at(
        &mut self,
        deadline_ms: i64,
        stream_id: u64,
        signal_id: i32,
        context_id: i32,
    ) -> u64 {
        let owner = self.owner();
        self.core
            .signaler
            .signal_at(deadline_ms, owner, stream_id, signal_id, context_id)
    }

    pub fn signal_now(&mut self, stream_id: u64, signal_id: i32, context_id: i32) {
        let owner = self.owner();
        self.core
            .signaler
            .signal_now(owner, stream_id, signal_id, context_id);
    }

    pub fn cancel(&mut self, cancel_id: u64) -> bool {
        self.core.signaler.cancel(cancel_id)
    }

    /// Asks for a `SIGNAL_BUDGET_CREDITED` signal when `budget_id` is credited.
    pub fn watch_budget(&mut self, budget_id: u64, stream_id: u64) {
        let watcher = BudgetWatcher::new(self.core.shard, self.owner(), stream_id);
        self.core.creditor.watch(budget_id, watcher);
    }

    /// Credits a budget and wakes the streams watching it.
    pub fn credit_budget(&mut self, budget_id: u64, credit: i64) -> i64 {
        let available = self.core.creditor.credit(budget_id, credit);
        for watcher in self.core.creditor.take_watchers(budget_id) {
            if watcher.shard == self.core.shard {
                self.core.signaler.signal_now(
                    watcher.owner,
                    watcher.stream_id,
                    SIGNAL_BUDGET_CREDITED,
                    0,
                );
            } else {
                self.core.remote_wakeups.push(watcher);
            }
        }
        available
    }
}
