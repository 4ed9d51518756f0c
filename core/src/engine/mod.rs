//! # Stream Engine
//!
//! One [`Engine`] runs per worker shard and owns every stream opened on it.
//! Dispatch is single threaded and cooperative: frames written by a factory
//! are queued and delivered after the factory returns, so no factory is ever
//! re-entered while it is handling a frame.
//!
//! Factories are bound to a `routed_id` for the binding kinds they accept. A
//! Begin is delivered to the factory bound to its `(routed_id, kind)`; when
//! no factory claims a Begin written by a factory, the stream leaves the
//! engine through the outbound queue. Every later frame of the stream
//! follows the link created by its Begin:
//!
//! ```text
//!                 initial id (odd)              reply id (initial ^ 1)
//! initiator  --Begin/Data/End/Abort/Flush-->   <--Window/Reset--
//! acceptor   <--Window/Reset--                 --Begin/Data/End/Abort/Flush-->
//! ```

pub mod context;
pub mod route;
pub mod signaler;

pub use context::Context;
pub use route::{RouteResolver, StaticRoutes};
pub use signaler::{Clock, ManualClock, Signaler, SystemClock, Timer};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::cache::PartitionCache;
use crate::config::GatewayConfig;
use crate::flow::{BudgetCreditor, BudgetWatcher, SlotPool};
use crate::frame::{
    is_initial, Begin, BeginEx, Frame, FrameHeader, KafkaBeginEx, KafkaKind, KafkaRequestBeginEx,
    KafkaResetEx, Reset, Signal,
};
use crate::metrics::GatewayMetrics;

/// Fans in front of the partition cache.
pub const CACHE_BINDING: u64 = 1;
/// Request clients speaking the Kafka protocol.
pub const CLIENT_BINDING: u64 = 2;
/// Connection pool multiplexing request clients.
pub const POOL_BINDING: u64 = 3;
/// Raw broker connections, served outside the engine.
pub const NETWORK_BINDING: u64 = 4;

/// Signal raised for a stream waiting on a budget that was just credited.
pub const SIGNAL_BUDGET_CREDITED: i32 = -1;

const FIRST_INTERNAL_STREAM_ID: u64 = 0x4000_0000_0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    CreateTopics,
    DeleteTopics,
    DescribeCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Kafka(KafkaKind),
    Request(RequestKind),
    Network,
}

impl BindingKind {
    /// Binding kind selected by a Begin extension; unrouted when it has none.
    pub fn of(extension: &BeginEx) -> Option<Self> {
        match extension {
            BeginEx::Kafka(KafkaBeginEx::Request(request)) => {
                Some(BindingKind::Request(match request {
                    KafkaRequestBeginEx::CreateTopics { .. } => RequestKind::CreateTopics,
                    KafkaRequestBeginEx::DeleteTopics { .. } => RequestKind::DeleteTopics,
                    KafkaRequestBeginEx::DescribeCluster { .. } => RequestKind::DescribeCluster,
                }))
            }
            BeginEx::Kafka(ex) => Some(BindingKind::Kafka(ex.kind())),
            BeginEx::Proxy(_) => Some(BindingKind::Network),
            BeginEx::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Application connections and broker sockets outside the engine.
    External,
    Factory(usize),
}

#[derive(Debug)]
struct Link {
    initiator: Endpoint,
    acceptor: Endpoint,
    reply_opened: bool,
    initial_closed: bool,
    reply_closed: bool,
}

impl Link {
    fn new(initiator: Endpoint, acceptor: Endpoint) -> Self {
        Self {
            initiator,
            acceptor,
            reply_opened: false,
            initial_closed: false,
            reply_closed: false,
        }
    }
}

/// Accepts streams of the binding kinds it declares.
pub trait StreamFactory: Send {
    fn kinds(&self) -> Vec<BindingKind>;

    /// Handles the Begin of a new stream; `false` refuses it.
    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool;

    /// Handles every later frame of the streams it accepted or initiated,
    /// and the signals it scheduled.
    fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame);
}

/// Engine state reachable from a [`Context`].
pub struct EngineCore {
    shard: usize,
    config: Arc<GatewayConfig>,
    routes: Arc<dyn RouteResolver>,
    creditor: Arc<BudgetCreditor>,
    metrics: Arc<GatewayMetrics>,
    clock: Arc<dyn Clock>,
    signaler: Signaler,
    decode_pool: SlotPool,
    encode_pool: SlotPool,
    cache: PartitionCache,
    bindings: HashMap<(u64, BindingKind), usize>,
    links: HashMap<u64, Link>,
    pending: VecDeque<(Endpoint, Frame)>,
    outbound: Vec<Frame>,
    remote_wakeups: Vec<BudgetWatcher>,
    next_stream_id: u64,
    next_trace_id: u64,
}

pub struct Engine {
    factories: Vec<Box<dyn StreamFactory>>,
    core: EngineCore,
}

impl Engine {
    pub fn new(
        shard: usize,
        config: Arc<GatewayConfig>,
        routes: Arc<dyn RouteResolver>,
        creditor: Arc<BudgetCreditor>,
        metrics: Arc<GatewayMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let decode_pool = SlotPool::new(config.slot_count, config.slot_capacity);
        let encode_pool = SlotPool::new(config.slot_count, config.slot_capacity);
        Self {
            factories: Vec::new(),
            core: EngineCore {
                shard,
                config,
                routes,
                creditor,
                metrics,
                clock,
                signaler: Signaler::new(),
                decode_pool,
                encode_pool,
                cache: PartitionCache::default(),
                bindings: HashMap::new(),
                links: HashMap::new(),
                pending: VecDeque::new(),
                outbound: Vec::new(),
                remote_wakeups: Vec::new(),
                next_stream_id: FIRST_INTERNAL_STREAM_ID,
                next_trace_id: 1,
            },
        }
    }

    /// Binds `factory` under `routed_id` for every kind it declares and
    /// returns its index.
    pub fn bind(&mut self, routed_id: u64, factory: Box<dyn StreamFactory>) -> usize {
        let index = self.factories.len();
        for kind in factory.kinds() {
            if let Some(previous) = self.core.bindings.insert((routed_id, kind), index) {
                debug!(
                    "binding {} {:?} moved from factory {} to {}",
                    routed_id, kind, previous, index
                );
            }
        }
        self.factories.push(factory);
        index
    }

    pub fn shard(&self) -> usize {
        self.core.shard
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.core.metrics
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.core.config
    }

    pub fn now(&self) -> i64 {
        self.core.clock.now_ms()
    }

    /// Delivers a frame arriving from outside the engine.
    pub fn on_external(&mut self, frame: Frame) {
        self.core.metrics.record_frame_in();
        self.core.pending.push_back((Endpoint::External, frame));
        self.run();
    }

    /// Fires every timer that is due and runs the resulting work.
    pub fn poll(&mut self) -> usize {
        let due = self.core.signaler.poll_due(self.core.clock.now_ms());
        let fired = due.len();
        for timer in due {
            self.fire(timer);
            self.run();
        }
        self.run();
        fired
    }

    /// Wakes a stream of this shard whose budget was credited on another.
    pub fn wake(&mut self, watcher: BudgetWatcher) {
        self.core
            .signaler
            .signal_now(watcher.owner, watcher.stream_id, SIGNAL_BUDGET_CREDITED, 0);
        self.run();
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.core.signaler.next_deadline()
    }

    /// Frames leaving the engine, in the order they were written.
    pub fn drain_outbound(&mut self) -> Vec<Frame> {
        let outbound = std::mem::take(&mut self.core.outbound);
        for _ in &outbound {
            self.core.metrics.record_frame_out();
        }
        outbound
    }

    /// Budget watchers owned by other shards, to be forwarded by the caller.
    pub fn drain_remote_wakeups(&mut self) -> Vec<BudgetWatcher> {
        std::mem::take(&mut self.core.remote_wakeups)
    }

    /// Number of streams with at least one open half.
    pub fn stream_count(&self) -> usize {
        self.core.links.len()
    }

    fn run(&mut self) {
        loop {
            if let Some((sender, frame)) = self.core.pending.pop_front() {
                self.dispatch(sender, frame);
            } else if let Some(timer) = self.core.signaler.pop_immediate() {
                self.fire(timer);
            } else {
                break;
            }
        }
    }

    fn fire(&mut self, timer: Timer) {
        let Some(factory) = self.factories.get_mut(timer.owner) else {
            trace!("signal {} for unknown owner {}", timer.signal_id, timer.owner);
            return;
        };
        let frame = Frame::Signal(Signal {
            header: FrameHeader::new(0, 0, timer.stream_id),
            cancel_id: timer.cancel_id,
            signal_id: timer.signal_id,
            context_id: timer.context_id,
        });
        let mut cx = Context::new(&mut self.core, Endpoint::Factory(timer.owner));
        factory.on_frame(&mut cx, frame);
    }

    fn dispatch(&mut self, sender: Endpoint, frame: Frame) {
        let stream_id = frame.stream_id();
        let initial_id = stream_id | 1;

        if let Frame::Begin(begin) = &frame {
            if is_initial(stream_id) && !self.core.links.contains_key(&initial_id) {
                self.open(sender, begin);
                return;
            }
        }

        let Some(link) = self.core.links.get_mut(&initial_id) else {
            trace!(
                "{} on unknown stream {}, dropped",
                frame.name(),
                stream_id
            );
            return;
        };

        let target = if is_initial(stream_id) == frame.is_forward() {
            link.acceptor
        } else {
            link.initiator
        };

        if matches!(frame, Frame::Begin(_)) && !is_initial(stream_id) {
            link.reply_opened = true;
        }

        if matches!(frame, Frame::End(_) | Frame::Abort(_) | Frame::Reset(_)) {
            if is_initial(stream_id) {
                link.initial_closed = true;
                // a reset before the reply began means the reply never will
                if matches!(frame, Frame::Reset(_)) && !link.reply_opened {
                    link.reply_closed = true;
                }
            } else {
                link.reply_closed = true;
            }
            if link.initial_closed && link.reply_closed {
                self.core.links.remove(&initial_id);
            }
        }

        self.deliver(target, frame);
    }

    fn open(&mut self, sender: Endpoint, begin: &Begin) {
        let initial_id = begin.header.stream_id;
        let binding = BindingKind::of(&begin.extension).and_then(|kind| {
            self.core
                .bindings
                .get(&(begin.header.routed_id, kind))
                .copied()
        });

        match binding {
            Some(index) => {
                let acceptor = Endpoint::Factory(index);
                self.core
                    .links
                    .insert(initial_id, Link::new(sender, acceptor));
                let accepted = {
                    let mut cx = Context::new(&mut self.core, acceptor);
                    self.factories[index].new_stream(&mut cx, begin)
                };
                if accepted {
                    self.core.metrics.record_stream_opened();
                } else {
                    self.refuse(sender, begin);
                }
            }
            None => match sender {
                Endpoint::Factory(_) => {
                    self.core
                        .links
                        .insert(initial_id, Link::new(sender, Endpoint::External));
                    self.core.outbound.push(Frame::Begin(begin.clone()));
                }
                Endpoint::External => {
                    trace!(
                        "no binding for stream {} routed {}",
                        initial_id,
                        begin.header.routed_id
                    );
                    self.refuse(sender, begin);
                }
            },
        }
    }

    fn refuse(&mut self, sender: Endpoint, begin: &Begin) {
        let initial_id = begin.header.stream_id;
        self.core.links.remove(&initial_id);
        self.core.metrics.record_stream_refused();
        trace!("stream {} refused", initial_id);

        let header = begin.header;
        let reset = Frame::Reset(Reset {
            header: FrameHeader::new(header.origin_id, header.routed_id, initial_id)
                .trace(header.trace_id, header.authorization),
            extension: Some(KafkaResetEx::new(0)),
        });
        match sender {
            Endpoint::Factory(index) => {
                let mut cx = Context::new(&mut self.core, sender);
                self.factories[index].on_frame(&mut cx, reset);
            }
            Endpoint::External => self.core.outbound.push(reset),
        }
    }

    fn deliver(&mut self, target: Endpoint, frame: Frame) {
        match target {
            Endpoint::External => self.core.outbound.push(frame),
            Endpoint::Factory(index) => {
                let mut cx = Context::new(&mut self.core, target);
                self.factories[index].on_frame(&mut cx, frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{reply_id, BeginEx, Data, End, Window, FLAGS_COMPLETE};
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Accepts describe streams and echoes every Data back on the reply.
    struct Echo {
        seen: Arc<Mutex<Vec<String>>>,
        refuse: bool,
    }

    impl StreamFactory for Echo {
        fn kinds(&self) -> Vec<BindingKind> {
            vec![BindingKind::Kafka(KafkaKind::Describe)]
        }

        fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
            self.seen.lock().push(format!("BEGIN {}", begin.header.stream_id));
            if self.refuse {
                return false;
            }
            let header = begin.header;
            cx.begin(
                FrameHeader::new(header.origin_id, header.routed_id, reply_id(header.stream_id)),
                0,
                BeginEx::None,
            );
            true
        }

        fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
            self.seen.lock().push(format!("{} {}", frame.name(), frame.stream_id()));
            match frame {
                Frame::Data(data) => cx.data(
                    FrameHeader::new(0, 0, reply_id(data.header.stream_id)),
                    FLAGS_COMPLETE,
                    0,
                    data.reserved,
                    data.payload,
                    None,
                ),
                Frame::Signal(signal) => {
                    cx.end(FrameHeader::new(0, 0, reply_id(signal.header.stream_id)));
                }
                _ => {}
            }
        }
    }

    fn engine(refuse: bool) -> (Engine, Arc<Mutex<Vec<String>>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut engine = Engine::new(
            0,
            Arc::new(GatewayConfig::default()),
            Arc::new(StaticRoutes::default()),
            Arc::new(BudgetCreditor::new()),
            Arc::new(GatewayMetrics::new()),
            clock.clone(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.bind(
            CLIENT_BINDING,
            Box::new(Echo {
                seen: seen.clone(),
                refuse,
            }),
        );
        (engine, seen, clock)
    }

    fn describe_begin(stream_id: u64) -> Frame {
        Frame::Begin(Begin {
            header: FrameHeader::new(0, CLIENT_BINDING, stream_id),
            affinity: 0,
            extension: BeginEx::Kafka(KafkaBeginEx::Describe {
                topic: "events".to_string(),
                configs: vec![],
            }),
        })
    }

    #[test]
    fn test_begin_routes_to_binding_and_reply_goes_out() {
        let (mut engine, seen, _) = engine(false);
        engine.on_external(describe_begin(7));
        engine.on_external(Frame::Data(Data {
            header: FrameHeader::new(0, CLIENT_BINDING, 7),
            flags: FLAGS_COMPLETE,
            budget_id: 0,
            reserved: 5,
            payload: Some(Bytes::from_static(b"hello")),
            extension: None,
        }));

        assert_eq!(*seen.lock(), vec!["BEGIN 7", "DATA 7"]);
        let outbound = engine.drain_outbound();
        assert_eq!(outbound.len(), 2);
        assert!(matches!(&outbound[0], Frame::Begin(b) if b.header.stream_id == 6));
        assert!(
            matches!(&outbound[1], Frame::Data(d) if d.payload.as_deref() == Some(&b"hello"[..]))
        );
        assert_eq!(engine.metrics().snapshot().frames_out, 2);
    }

    #[test]
    fn test_unrouted_begin_from_outside_is_reset() {
        let (mut engine, seen, _) = engine(false);
        engine.on_external(Frame::Begin(Begin {
            header: FrameHeader::new(0, POOL_BINDING, 9),
            affinity: 0,
            extension: BeginEx::None,
        }));
        assert!(seen.lock().is_empty());
        let outbound = engine.drain_outbound();
        assert_eq!(outbound.len(), 1);
        assert!(matches!(&outbound[0], Frame::Reset(r) if r.header.stream_id == 9));
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn test_refused_stream_leaves_no_link() {
        let (mut engine, seen, _) = engine(true);
        engine.on_external(describe_begin(7));
        engine.on_external(Frame::Window(Window {
            header: FrameHeader::new(0, CLIENT_BINDING, 6),
            budget_id: 0,
            padding: 0,
            minimum: 0,
        }));
        assert_eq!(*seen.lock(), vec!["BEGIN 7"]);
        assert_eq!(engine.stream_count(), 0);
        assert!(engine
            .drain_outbound()
            .iter()
            .any(|f| matches!(f, Frame::Reset(r) if r.header.stream_id == 7 && r.error() == 0)));
    }

    #[test]
    fn test_link_removed_when_both_halves_close() {
        let (mut engine, _, _) = engine(false);
        engine.on_external(describe_begin(7));
        engine.on_external(Frame::End(End {
            header: FrameHeader::new(0, CLIENT_BINDING, 7),
        }));
        assert_eq!(engine.stream_count(), 1);

        engine.core.signaler.signal_at(1_000, 0, 7, 1, 0);
        assert_eq!(engine.poll(), 1);
        assert_eq!(engine.stream_count(), 0);
        assert!(matches!(engine.drain_outbound().last(), Some(Frame::End(e)) if e.header.stream_id == 6));
    }

    /// Opens a network stream for every describe stream it accepts.
    struct Opener {
        resets: Arc<Mutex<Vec<u64>>>,
    }

    impl StreamFactory for Opener {
        fn kinds(&self) -> Vec<BindingKind> {
            vec![BindingKind::Kafka(KafkaKind::Describe)]
        }

        fn new_stream(&mut self, cx: &mut Context<'_>, _begin: &Begin) -> bool {
            let initial_id = cx.supply_initial_id();
            cx.begin(
                FrameHeader::new(CLIENT_BINDING, NETWORK_BINDING, initial_id),
                0,
                BeginEx::Proxy(crate::frame::ProxyBeginEx::new("broker", 9092)),
            );
            true
        }

        fn on_frame(&mut self, _cx: &mut Context<'_>, frame: Frame) {
            if let Frame::Reset(reset) = frame {
                self.resets.lock().push(reset.header.stream_id);
            }
        }
    }

    #[test]
    fn test_reset_before_reply_begin_removes_link() {
        let (mut engine, _, _) = engine(false);
        let resets = Arc::new(Mutex::new(Vec::new()));
        engine.bind(CLIENT_BINDING, Box::new(Opener { resets: resets.clone() }));
        engine.on_external(describe_begin(7));

        let outbound = engine.drain_outbound();
        let network_id = match outbound.as_slice() {
            [Frame::Begin(begin)] => begin.header.stream_id,
            other => panic!("unexpected outbound {:?}", other),
        };
        assert_eq!(engine.stream_count(), 2);

        engine.on_external(Frame::Reset(Reset {
            header: FrameHeader::new(NETWORK_BINDING, CLIENT_BINDING, network_id),
            extension: None,
        }));
        assert_eq!(*resets.lock(), vec![network_id]);
        assert_eq!(engine.stream_count(), 1);
    }

    #[test]
    fn test_timers_fire_when_due() {
        let (mut engine, seen, clock) = engine(false);
        engine.on_external(describe_begin(7));
        engine.core.signaler.signal_at(1_500, 0, 7, 1, 0);

        assert_eq!(engine.poll(), 0);
        assert_eq!(engine.next_deadline(), Some(1_500));
        clock.advance(500);
        assert_eq!(engine.poll(), 1);
        assert_eq!(seen.lock().last().map(String::as_str), Some("SIGNAL 7"));
    }
}
