//! # Request Clients
//!
//! A request client pairs an application stream with a network stream to a
//! broker. Requests are encoded into the network stream within its credit
//! window; responses arrive in chunks of any size and are decoded by a step
//! machine that resumes exactly where the previous chunk ended. Bytes that do
//! not yet form a complete step are parked in a decode slot, and the network
//! reply window only acknowledges what has been consumed.
//!
//! The driver in this module is shared by every API; each API plugs in as a
//! [`RequestProtocol`] that encodes its request and decodes its response
//! steps, reporting what should happen to the application stream as
//! [`Effect`]s.

pub mod create_topics;
pub mod delete_topics;
pub mod describe;
pub mod describe_cluster;
pub mod fetch;
pub mod offset_commit;
pub mod offset_fetch;
pub mod produce;
pub mod sasl;

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::{debug, trace, warn};

use crate::config::{GatewayConfig, SaslConfig};
use crate::engine::{
    BindingKind, Context, StreamFactory, CLIENT_BINDING, NETWORK_BINDING, POOL_BINDING,
    SIGNAL_BUDGET_CREDITED,
};
use crate::flow::{Reservation, SlotId, StreamState, StreamWindow};
use crate::frame::{
    is_initial, reply_id, Begin, BeginEx, Data, Frame, FrameHeader, KafkaBeginEx, KafkaDataEx,
    KafkaFlushEx, KafkaResetEx, ProxyBeginEx, Signal, FLAG_FIN, FLAG_INIT,
};
use crate::protocol::kafka::codec::Result as CodecResult;
use crate::protocol::kafka::{KafkaCodecError, ResponseHeader, WireReader};
use sasl::{SaslOutcome, SaslStep};

pub use create_topics::CreateTopicsProtocol;
pub use delete_topics::DeleteTopicsProtocol;
pub use describe::DescribeProtocol;
pub use describe_cluster::DescribeClusterProtocol;
pub use fetch::FetchProtocol;
pub use offset_commit::OffsetCommitProtocol;
pub use offset_fetch::OffsetFetchProtocol;
pub use produce::ProduceProtocol;

pub type DescribeClientFactory = RequestClientFactory<DescribeProtocol>;
pub type DeleteTopicsClientFactory = RequestClientFactory<DeleteTopicsProtocol>;
pub type CreateTopicsClientFactory = RequestClientFactory<CreateTopicsProtocol>;
pub type DescribeClusterClientFactory = RequestClientFactory<DescribeClusterProtocol>;
pub type OffsetCommitClientFactory = RequestClientFactory<OffsetCommitProtocol>;
pub type OffsetFetchClientFactory = RequestClientFactory<OffsetFetchProtocol>;
pub type ProduceClientFactory = RequestClientFactory<ProduceProtocol>;
pub type FetchClientFactory = RequestClientFactory<FetchProtocol>;

/// Encode the next request if the network allows it.
pub const SIGNAL_NEXT_REQUEST: i32 = 1;
/// Scheduled refresh of a repeating request.
pub const SIGNAL_REFRESH: i32 = 2;

/// Position of the response decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<S> {
    Sasl(SaslStep),
    Protocol(S),
    /// Between responses; any byte here is unexpected.
    Idle,
    /// Fatal response; cleans up with the error code.
    Reject(i32),
    /// Swallows everything after a failure.
    IgnoreAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    SaslHandshake,
    SaslAuthenticate,
    Request,
}

/// Application-visible outcome of a decoded step.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AppBegin(KafkaBeginEx),
    AppData {
        flags: u8,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    },
    AppFlush(Option<KafkaFlushEx>),
    /// Re-evaluate the credit granted to the application.
    AppWindow,
    AppEnd,
    /// Clean up the application with an error code and end the network.
    Fail(i32),
    ResponseComplete,
    NextRequest,
    NextRequestAt(i64),
    NetworkEnd,
}

/// What a decoder step may rely on besides its input bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub now_ms: i64,
    /// Credit left on the application reply, `0` while frames are queued.
    pub app_reply_budget: i32,
    pub app_reply_padding: i32,
}

impl DecodeContext {
    /// Whether a payload of `length` bytes can be sent to the application now.
    pub fn fits(&self, length: usize) -> bool {
        length as i64 + self.app_reply_padding as i64 <= self.app_reply_budget as i64
    }
}

/// One Kafka API spoken by a [`RequestClient`].
pub trait RequestProtocol: Sized + Send + 'static {
    type Step: Copy + PartialEq + Debug + Send;

    const NAME: &'static str;

    fn kinds() -> Vec<BindingKind>;

    /// Builds the protocol state for an application Begin; `None` refuses it.
    fn open(config: &GatewayConfig, begin: &Begin, ex: &KafkaBeginEx) -> Option<Self>;

    /// Effects to apply as soon as the application stream is accepted.
    fn opened(&mut self, _effects: &mut Vec<Effect>) {}

    /// Handles application Data; `Err(code)` cleans up with that code.
    fn on_app_data(&mut self, _data: &Data, _effects: &mut Vec<Effect>) -> Result<(), i32> {
        Err(0)
    }

    /// Maximum credit granted to the application initial stream.
    fn app_credit(&self, _config: &GatewayConfig) -> i32 {
        0
    }

    /// Application bytes accepted but not yet acknowledged.
    fn app_unacked(&self) -> i64 {
        0
    }

    fn has_request(&self) -> bool;

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32);

    fn first_step(&self) -> Self::Step;

    fn decode(
        &mut self,
        step: Self::Step,
        r: &mut WireReader<'_>,
        dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> CodecResult<Step<Self::Step>>;

    /// A refresh scheduled with [`Effect::NextRequestAt`] is due.
    fn on_refresh(&mut self) {}
}

/// Reads a whole response: header, then the complete body as its own reader.
pub(crate) fn read_response<'a>(
    r: &mut WireReader<'a>,
    api_key: i16,
    api_version: i16,
) -> CodecResult<(ResponseHeader, WireReader<'a>)> {
    let start = r.position();
    let header = ResponseHeader::decode_for(r, api_key, api_version)?;
    let consumed = r.position() - start;
    let body = r.slice(header.frame_size().saturating_sub(consumed))?;
    Ok((header, WireReader::new(body)))
}

/// A response body that runs short of its declared length is malformed.
pub(crate) fn complete<T>(result: CodecResult<T>) -> CodecResult<T> {
    result.map_err(|e| {
        if e.is_underrun() {
            KafkaCodecError::invalid(format!("truncated response body: {}", e))
        } else {
            e
        }
    })
}

#[derive(Debug)]
struct PendingData {
    flags: u8,
    payload: Option<Bytes>,
    extension: Option<KafkaDataEx>,
}

#[derive(Debug)]
struct AppStream {
    origin_id: u64,
    routed_id: u64,
    initial_id: u64,
    affinity: u64,
    trace_id: u64,
    authorization: u64,
    state: StreamState,
    initial: StreamWindow,
    reply: StreamWindow,
    pending: VecDeque<PendingData>,
}

impl AppStream {
    fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.initial_id)
            .window(
                self.initial.sequence,
                self.initial.acknowledge,
                self.initial.maximum,
            )
            .trace(self.trace_id, self.authorization)
    }

    fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, reply_id(self.initial_id))
            .window(self.reply.sequence, self.reply.acknowledge, self.reply.maximum)
            .trace(self.trace_id, self.authorization)
    }
}

#[derive(Debug)]
struct NetworkStream {
    routed_id: u64,
    initial_id: u64,
    address: ProxyBeginEx,
    state: StreamState,
    initial: StreamWindow,
    reply: StreamWindow,
}

impl NetworkStream {
    fn initial_header(&self, trace_id: u64) -> FrameHeader {
        FrameHeader::new(CLIENT_BINDING, self.routed_id, self.initial_id)
            .window(
                self.initial.sequence,
                self.initial.acknowledge,
                self.initial.maximum,
            )
            .trace(trace_id, 0)
    }

    fn reply_header(&self, trace_id: u64) -> FrameHeader {
        FrameHeader::new(CLIENT_BINDING, self.routed_id, reply_id(self.initial_id))
            .window(self.reply.sequence, self.reply.acknowledge, self.reply.maximum)
            .trace(trace_id, 0)
    }
}

pub struct RequestClient<P: RequestProtocol> {
    app: AppStream,
    network: NetworkStream,
    protocol: P,
    step: Step<P::Step>,
    encoder: Encoder,
    sasl: Option<SaslConfig>,
    next_request_id: i64,
    next_response_id: i64,
    decode_slot: Option<SlotId>,
    decode_slot_reserved: i64,
    encode_slot: Option<SlotId>,
    encode_init: bool,
    refresh_id: Option<u64>,
}

impl<P: RequestProtocol> RequestClient<P> {
    fn new(cx: &mut Context<'_>, begin: &Begin, protocol: P, address: ProxyBeginEx) -> Self {
        let header = begin.header;
        let sasl = cx.config().sasl.clone();
        let routed_id = if cx.config().client_connection_pool {
            POOL_BINDING
        } else {
            NETWORK_BINDING
        };
        Self {
            app: AppStream {
                origin_id: header.origin_id,
                routed_id: header.routed_id,
                initial_id: header.stream_id,
                affinity: begin.affinity,
                trace_id: header.trace_id,
                authorization: header.authorization,
                state: StreamState::new(),
                initial: StreamWindow::new(),
                reply: StreamWindow::new(),
                pending: VecDeque::new(),
            },
            network: NetworkStream {
                routed_id,
                initial_id: cx.supply_initial_id(),
                address,
                state: StreamState::new(),
                initial: StreamWindow::new(),
                reply: StreamWindow::new(),
            },
            protocol,
            step: Step::Idle,
            encoder: if sasl.is_some() {
                Encoder::SaslHandshake
            } else {
                Encoder::Request
            },
            sasl,
            next_request_id: 0,
            next_response_id: 0,
            decode_slot: None,
            decode_slot_reserved: 0,
            encode_slot: None,
            encode_init: false,
            refresh_id: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.app.state.closed()
            && (self.network.state.closed() || !self.network.state.initial_opening())
    }

    // ------------------------------------------------------------------
    // Application stream
    // ------------------------------------------------------------------

    fn on_app_begin(&mut self, cx: &mut Context<'_>) {
        self.app.state.open_initial();
        self.do_network_begin(cx);
        let mut effects = Vec::new();
        self.protocol.opened(&mut effects);
        self.apply_effects(cx, effects);
    }

    fn on_app_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        match frame {
            Frame::Data(data) => self.on_app_data(cx, data),
            Frame::End(_) => {
                self.app.state.close_initial();
                if self.encode_slot.is_none() {
                    self.do_network_end_if_necessary(cx);
                }
            }
            Frame::Abort(_) => {
                self.app.state.close_initial();
                self.cleanup(cx, 0);
            }
            Frame::Window(window) => {
                let header = window.header;
                if let Err(e) = self.app.reply.apply_window(
                    header.acknowledge,
                    header.maximum,
                    window.padding,
                    window.minimum,
                    window.budget_id,
                ) {
                    warn!("{} application window rejected: {}", P::NAME, e);
                    self.cleanup(cx, 0);
                    return;
                }
                self.app.state.opened_reply();
                self.flush_app_pending(cx);
                self.decode_slot_if_necessary(cx);
            }
            Frame::Reset(_) => {
                self.app.state.close_reply();
                self.cleanup(cx, 0);
            }
            Frame::Flush(_) => self.do_encode_request_if_necessary(cx),
            Frame::Begin(_) | Frame::Signal(_) => {}
        }
    }

    fn on_app_data(&mut self, cx: &mut Context<'_>, data: Data) {
        if let Err(e) = self
            .app
            .initial
            .on_data(data.header.sequence, data.reserved)
        {
            warn!("{} application data rejected: {}", P::NAME, e);
            self.cleanup(cx, 0);
            return;
        }
        let mut effects = Vec::new();
        match self.protocol.on_app_data(&data, &mut effects) {
            Ok(()) => {
                self.apply_effects(cx, effects);
                self.do_app_window_if_necessary(cx);
                self.do_encode_request_if_necessary(cx);
            }
            Err(code) => self.cleanup(cx, code),
        }
    }

    fn do_app_begin_if_necessary(&mut self, cx: &mut Context<'_>, ex: KafkaBeginEx) {
        if !self.app.state.reply_opening() {
            self.app.state.open_reply();
            let header = self.app.reply_header();
            cx.begin(header, self.app.affinity, BeginEx::Kafka(ex));
        }
    }

    fn do_app_data(
        &mut self,
        cx: &mut Context<'_>,
        flags: u8,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    ) {
        if self.app.state.reply_closed() {
            return;
        }
        self.app.pending.push_back(PendingData {
            flags,
            payload,
            extension,
        });
        self.flush_app_pending(cx);
    }

    fn flush_app_pending(&mut self, cx: &mut Context<'_>) {
        while let Some(pending) = self.app.pending.front() {
            let length = pending.payload.as_ref().map_or(0, Bytes::len);
            let reserved = (length as i64 + self.app.reply.padding as i64) as i32;
            if !self.app.state.reply_opening() || reserved > self.app.reply.budget() {
                break;
            }
            let Some(pending) = self.app.pending.pop_front() else {
                break;
            };
            let header = self.app.reply_header();
            cx.data(
                header,
                pending.flags,
                self.app.reply.budget_id,
                reserved,
                pending.payload,
                pending.extension,
            );
            self.app.reply.sent(reserved);
        }
    }

    fn do_app_window_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.app.state.initial_closed() {
            return;
        }
        let credit = self.protocol.app_credit(cx.config());
        let unacked = self.protocol.app_unacked();
        let opened = self.app.state.initial_opened();
        if self.app.initial.compute_credit(unacked, credit, opened).is_some() {
            self.app.state.opened_initial();
            let header = self.app.initial_header();
            cx.window(header, 0, 0, 0);
        }
    }

    fn do_app_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if !self.app.state.reply_opening() {
            self.cleanup_app(cx, 0);
        } else if !self.app.state.reply_closed() && self.app.pending.is_empty() {
            self.app.state.close_reply();
            let header = self.app.reply_header();
            cx.end(header);
        }
    }

    fn do_app_reset_if_necessary(&mut self, cx: &mut Context<'_>, error: i32) {
        if !self.app.state.initial_closed() {
            self.app.state.close_initial();
            let header = self.app.initial_header();
            cx.reset(header, Some(KafkaResetEx::new(error)));
        }
    }

    fn do_app_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.app.state.reply_opening() && !self.app.state.reply_closed() {
            let header = self.app.reply_header();
            cx.abort(header);
        }
        self.app.state.close_reply();
        self.app.pending.clear();
    }

    // ------------------------------------------------------------------
    // Network stream
    // ------------------------------------------------------------------

    fn do_network_begin(&mut self, cx: &mut Context<'_>) {
        self.network.state.open_initial();
        let header = self.network.initial_header(self.app.trace_id);
        debug!(
            "{} client {} connecting to {}",
            P::NAME,
            self.app.initial_id,
            self.network.address.address()
        );
        cx.begin(
            header,
            self.app.affinity,
            BeginEx::Proxy(self.network.address.clone()),
        );
    }

    fn on_network_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        match frame {
            Frame::Begin(_) => {
                self.network.state.open_reply();
                self.do_network_window_if_necessary(cx, 0);
            }
            Frame::Data(data) => self.on_network_data(cx, data),
            Frame::End(_) => {
                self.network.state.close_reply();
                if self.decode_slot.is_none() {
                    self.do_app_end_if_necessary(cx);
                }
                self.do_network_end_if_necessary(cx);
            }
            Frame::Abort(_) => {
                self.network.state.close_reply();
                self.cleanup(cx, 0);
            }
            Frame::Window(window) => {
                let header = window.header;
                if let Err(e) = self.network.initial.apply_window(
                    header.acknowledge,
                    header.maximum,
                    window.padding,
                    window.minimum,
                    window.budget_id,
                ) {
                    warn!("{} network window rejected: {}", P::NAME, e);
                    self.cleanup(cx, 0);
                    return;
                }
                if window.budget_id != 0 {
                    cx.creditor().acquire(window.budget_id);
                }
                self.network.state.opened_initial();
                self.flush_encode_slot(cx);
                self.do_encode_request_if_necessary(cx);
            }
            Frame::Reset(reset) => {
                self.network.state.close_initial();
                self.cleanup(cx, reset.error());
            }
            Frame::Flush(_) | Frame::Signal(_) => {}
        }
    }

    fn on_network_data(&mut self, cx: &mut Context<'_>, data: Data) {
        if let Err(e) = self
            .network
            .reply
            .on_data(data.header.sequence, data.reserved)
        {
            warn!("{} network data rejected: {}", P::NAME, e);
            self.cleanup(cx, 0);
            return;
        }
        let payload = data.payload.unwrap_or_default();
        match self.decode_slot {
            Some(slot) => {
                if !cx.decode_pool().append(slot, &payload) {
                    warn!("{} client {} decode slot overflow", P::NAME, self.app.initial_id);
                    cx.metrics().record_slot_exhausted();
                    self.cleanup(cx, 0);
                    return;
                }
                let buffer = Bytes::copy_from_slice(cx.decode_pool().buffer(slot));
                let reserved = self.decode_slot_reserved + data.reserved as i64;
                self.decode_network(cx, &buffer, reserved);
            }
            None => self.decode_network(cx, &payload, data.reserved as i64),
        }
    }

    /// Re-runs the decoder over parked bytes, e.g. once the application
    /// granted the credit a paused step was waiting for.
    fn decode_slot_if_necessary(&mut self, cx: &mut Context<'_>) {
        if let Some(slot) = self.decode_slot {
            let buffer = Bytes::copy_from_slice(cx.decode_pool().buffer(slot));
            let reserved = self.decode_slot_reserved;
            self.decode_network(cx, &buffer, reserved);
        }
    }

    fn decode_context(&self, cx: &Context<'_>) -> DecodeContext {
        let app_reply_budget = if self.app.pending.is_empty() && self.app.state.reply_opening() {
            self.app.reply.budget()
        } else {
            0
        };
        DecodeContext {
            now_ms: cx.now(),
            app_reply_budget,
            app_reply_padding: self.app.reply.padding,
        }
    }

    fn decode_network(&mut self, cx: &mut Context<'_>, buffer: &[u8], reserved: i64) {
        let limit = buffer.len();
        let mut progress = 0;

        loop {
            let previous = self.step;
            let mut reader = WireReader::new(&buffer[progress..]);
            let mut effects = Vec::new();
            let dcx = self.decode_context(cx);

            let next = match previous {
                Step::Sasl(step) => self.decode_sasl(step, &mut reader, &mut effects),
                Step::Protocol(step) => self.protocol.decode(step, &mut reader, &dcx, &mut effects),
                Step::Idle if reader.remaining() > 0 => Ok(Step::Reject(0)),
                Step::Idle => Ok(Step::Idle),
                Step::Reject(code) => Ok(Step::Reject(code)),
                Step::IgnoreAll => reader.skip(reader.remaining()).map(|_| Step::IgnoreAll),
            };

            let consumed = match next {
                Ok(step) => {
                    self.step = step;
                    reader.position()
                }
                Err(e) if e.is_underrun() => break,
                Err(e) => {
                    warn!(
                        "{} client {} malformed response: {}",
                        P::NAME,
                        self.app.initial_id,
                        e
                    );
                    cx.metrics().record_decode_reject();
                    self.cleanup(cx, 0);
                    self.step = Step::IgnoreAll;
                    progress = limit;
                    break;
                }
            };
            progress += consumed;

            self.apply_effects(cx, effects);

            if let Step::Reject(code) = self.step {
                trace!("{} client {} rejected with {}", P::NAME, self.app.initial_id, code);
                cx.metrics().record_decode_reject();
                self.cleanup(cx, code);
                self.step = Step::IgnoreAll;
                continue;
            }

            if self.step == previous && consumed == 0 {
                break;
            }
        }

        cx.metrics().record_bytes_decoded(progress);

        if progress < limit {
            let slot = match self.decode_slot {
                Some(slot) => slot,
                None => match cx.decode_pool().acquire(self.app.initial_id) {
                    Some(slot) => slot,
                    None => {
                        cx.metrics().record_slot_exhausted();
                        self.cleanup(cx, 0);
                        return;
                    }
                },
            };
            if let Some(slot_buffer) = cx.decode_pool().buffer_mut(slot) {
                slot_buffer.clear();
                slot_buffer.extend_from_slice(&buffer[progress..]);
            }
            self.decode_slot = Some(slot);
            self.decode_slot_reserved = ((limit - progress) as i64 * reserved) / limit as i64;
            self.do_network_window_if_necessary(cx, self.decode_slot_reserved);
        } else {
            self.release_decode_slot(cx);
            if self.network.state.reply_closed() {
                self.do_app_end_if_necessary(cx);
            } else if reserved > 0 {
                self.do_network_window_if_necessary(cx, 0);
            }
        }
    }

    fn decode_sasl(
        &mut self,
        step: SaslStep,
        r: &mut WireReader<'_>,
        effects: &mut Vec<Effect>,
    ) -> CodecResult<Step<P::Step>> {
        match sasl::decode(step, r)? {
            SaslOutcome::Next(next) => Ok(Step::Sasl(next)),
            SaslOutcome::HandshakeComplete { error_code: 0 } => {
                self.encoder = Encoder::SaslAuthenticate;
                effects.extend([Effect::ResponseComplete, Effect::NextRequest]);
                Ok(Step::Idle)
            }
            SaslOutcome::AuthenticateComplete { error_code: 0 } => {
                self.encoder = Encoder::Request;
                effects.extend([Effect::ResponseComplete, Effect::NextRequest]);
                Ok(Step::Idle)
            }
            SaslOutcome::HandshakeComplete { error_code }
            | SaslOutcome::AuthenticateComplete { error_code } => {
                warn!(
                    "{} client {} SASL failed with error {}",
                    P::NAME,
                    self.app.initial_id,
                    error_code
                );
                let error = if matches!(step, SaslStep::Authenticate) {
                    crate::protocol::kafka::KafkaErrorCode::SaslAuthenticationFailed.as_i32()
                } else {
                    error_code as i32
                };
                effects.push(Effect::Fail(error));
                Ok(Step::IgnoreAll)
            }
        }
    }

    fn do_network_window_if_necessary(&mut self, cx: &mut Context<'_>, min_no_ack: i64) {
        if self.network.state.reply_closed() || !self.network.state.reply_opening() {
            return;
        }
        let capacity = cx.decode_pool().slot_capacity() as i32;
        let opened = self.network.state.reply_opened();
        if self
            .network
            .reply
            .compute_credit(min_no_ack, capacity, opened)
            .is_some()
        {
            self.network.state.opened_reply();
            let header = self.network.reply_header(self.app.trace_id);
            cx.window(header, 0, 0, 0);
        }
    }

    fn do_encode_request_if_necessary(&mut self, cx: &mut Context<'_>) {
        if !self.network.state.initial_opened()
            || self.network.state.initial_closed()
            || self.encode_slot.is_some()
            || self.next_request_id != self.next_response_id
        {
            return;
        }

        let correlation_id = self.next_request_id as i32;
        let mut buf = BytesMut::new();
        match (self.encoder, &self.sasl) {
            (Encoder::SaslHandshake, Some(_)) => {
                sasl::encode_handshake(&mut buf, correlation_id, sasl::MECHANISM_PLAIN);
                self.step = Step::Sasl(SaslStep::HandshakeResponse);
            }
            (Encoder::SaslAuthenticate, Some(config)) => {
                sasl::encode_authenticate(&mut buf, correlation_id, &config.username, &config.password);
                self.step = Step::Sasl(SaslStep::AuthenticateResponse);
            }
            _ => {
                if !self.protocol.has_request() {
                    return;
                }
                self.protocol
                    .encode_request(cx.config(), &mut buf, correlation_id);
                self.step = Step::Protocol(self.protocol.first_step());
            }
        }
        self.next_request_id += 1;
        self.encode_init = true;
        self.send_network(cx, buf.freeze());
    }

    fn send_network(&mut self, cx: &mut Context<'_>, payload: Bytes) {
        let sent = self.write_network(cx, &payload);
        if sent < payload.len() {
            let Some(slot) = cx.encode_pool().acquire(self.app.initial_id) else {
                cx.metrics().record_slot_exhausted();
                self.cleanup(cx, 0);
                return;
            };
            if !cx.encode_pool().append(slot, &payload[sent..]) {
                cx.encode_pool().release(slot);
                cx.metrics().record_slot_exhausted();
                self.cleanup(cx, 0);
                return;
            }
            self.encode_slot = Some(slot);
        }
    }

    fn flush_encode_slot(&mut self, cx: &mut Context<'_>) {
        let Some(slot) = self.encode_slot else {
            return;
        };
        let pending = Bytes::copy_from_slice(cx.encode_pool().buffer(slot));
        let sent = self.write_network(cx, &pending);
        if sent == pending.len() {
            cx.encode_pool().release(slot);
            self.encode_slot = None;
            if self.app.state.initial_closed() {
                self.do_network_end_if_necessary(cx);
            }
        } else if let Some(buffer) = cx.encode_pool().buffer_mut(slot) {
            let _ = buffer.split_to(sent);
        }
    }

    /// Sends as much of `payload` as the network window and budget allow.
    fn write_network(&mut self, cx: &mut Context<'_>, payload: &[u8]) -> usize {
        let mut sent = 0;
        while sent < payload.len() {
            let remaining = payload.len() - sent;
            let Reservation::Send { reserved, length } = self.network.initial.reserve(remaining)
            else {
                break;
            };

            let budget_id = self.network.initial.budget_id;
            let padding = self.network.initial.padding;
            let (reserved, length) = if budget_id != 0 {
                let claimed = cx.creditor().claim(budget_id, padding + 1, reserved);
                if claimed == 0 {
                    cx.watch_budget(budget_id, self.app.initial_id);
                    break;
                }
                (claimed, ((claimed - padding) as usize).min(remaining))
            } else {
                (reserved, length)
            };

            let mut flags = 0;
            if self.encode_init {
                flags |= FLAG_INIT;
            }
            if sent + length == payload.len() {
                flags |= FLAG_FIN;
            }
            let header = self.network.initial_header(self.app.trace_id);
            cx.data(
                header,
                flags,
                budget_id,
                reserved,
                Some(Bytes::copy_from_slice(&payload[sent..sent + length])),
                None,
            );
            self.network.initial.sent(reserved);
            self.encode_init = false;
            sent += length;
        }
        sent
    }

    fn do_network_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.network.state.initial_opening() && !self.network.state.initial_closed() {
            self.network.state.close_initial();
            let header = self.network.initial_header(self.app.trace_id);
            cx.end(header);
        }
    }

    fn do_network_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.network.state.initial_opening() && !self.network.state.initial_closed() {
            self.network.state.close_initial();
            let header = self.network.initial_header(self.app.trace_id);
            cx.abort(header);
        }
    }

    fn do_network_reset_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.network.state.initial_opening() && !self.network.state.reply_closed() {
            self.network.state.close_reply();
            let header = self.network.reply_header(self.app.trace_id);
            cx.reset(header, None);
        }
    }

    // ------------------------------------------------------------------
    // Effects, signals, cleanup
    // ------------------------------------------------------------------

    fn apply_effects(&mut self, cx: &mut Context<'_>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::AppBegin(ex) => self.do_app_begin_if_necessary(cx, ex),
                Effect::AppData {
                    flags,
                    payload,
                    extension,
                } => self.do_app_data(cx, flags, payload, extension),
                Effect::AppFlush(extension) => {
                    if self.app.state.reply_opening() && !self.app.state.reply_closed() {
                        let header = self.app.reply_header();
                        cx.flush(header, self.app.reply.budget_id, 0, extension);
                    }
                }
                Effect::AppWindow => self.do_app_window_if_necessary(cx),
                Effect::AppEnd => self.do_app_end_if_necessary(cx),
                Effect::Fail(error) => {
                    self.cleanup_app(cx, error);
                    self.do_network_end_if_necessary(cx);
                    self.do_network_reset_if_necessary(cx);
                }
                Effect::ResponseComplete => self.next_response_id += 1,
                Effect::NextRequest => {
                    cx.signal_now(self.app.initial_id, SIGNAL_NEXT_REQUEST, 0);
                }
                Effect::NextRequestAt(deadline) => {
                    if let Some(cancel_id) = self.refresh_id.take() {
                        cx.cancel(cancel_id);
                    }
                    self.refresh_id =
                        Some(cx.signal_at(deadline, self.app.initial_id, SIGNAL_REFRESH, 0));
                }
                Effect::NetworkEnd => self.do_network_end_if_necessary(cx),
            }
        }
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, signal: Signal) {
        match signal.signal_id {
            SIGNAL_NEXT_REQUEST => self.do_encode_request_if_necessary(cx),
            SIGNAL_REFRESH => {
                self.refresh_id = None;
                self.protocol.on_refresh();
                self.do_encode_request_if_necessary(cx);
            }
            SIGNAL_BUDGET_CREDITED => {
                self.flush_encode_slot(cx);
                self.do_encode_request_if_necessary(cx);
            }
            other => trace!("{} ignoring signal {}", P::NAME, other),
        }
    }

    fn release_decode_slot(&mut self, cx: &mut Context<'_>) {
        if let Some(slot) = self.decode_slot.take() {
            cx.decode_pool().release(slot);
        }
        self.decode_slot_reserved = 0;
    }

    fn cleanup_app(&mut self, cx: &mut Context<'_>, error: i32) {
        self.do_app_reset_if_necessary(cx, error);
        self.do_app_abort_if_necessary(cx);
    }

    fn cleanup_network(&mut self, cx: &mut Context<'_>) {
        self.do_network_reset_if_necessary(cx);
        self.do_network_abort_if_necessary(cx);
        self.release_decode_slot(cx);
        if let Some(slot) = self.encode_slot.take() {
            cx.encode_pool().release(slot);
        }
        if let Some(cancel_id) = self.refresh_id.take() {
            cx.cancel(cancel_id);
        }
    }

    fn cleanup(&mut self, cx: &mut Context<'_>, error: i32) {
        self.cleanup_network(cx);
        self.cleanup_app(cx, error);
    }
}

/// Accepts application streams for one protocol and opens a network stream
/// for each.
pub struct RequestClientFactory<P: RequestProtocol> {
    clients: HashMap<u64, RequestClient<P>>,
    by_network: HashMap<u64, u64>,
    _protocol: PhantomData<P>,
}

impl<P: RequestProtocol> Default for RequestClientFactory<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RequestProtocol> RequestClientFactory<P> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            by_network: HashMap::new(),
            _protocol: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn remove_if_closed(&mut self, cx: &mut Context<'_>, app_id: u64) {
        if self.clients.get(&app_id).is_some_and(RequestClient::is_closed) {
            if let Some(mut client) = self.clients.remove(&app_id) {
                client.cleanup_network(cx);
                self.by_network.remove(&client.network.initial_id);
                trace!("{} client {} removed", P::NAME, app_id);
            }
        }
    }
}

impl<P: RequestProtocol> StreamFactory for RequestClientFactory<P> {
    fn kinds(&self) -> Vec<BindingKind> {
        P::kinds()
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
        let initial_id = begin.header.stream_id;
        if !is_initial(initial_id) || self.clients.contains_key(&initial_id) {
            return false;
        }
        let Some(ex) = begin.extension.kafka() else {
            return false;
        };
        let Some(kind) = BindingKind::of(&begin.extension) else {
            return false;
        };
        let Some(protocol) = P::open(cx.config(), begin, ex) else {
            return false;
        };
        let Some(address) = cx.routes().resolve(kind, ex.topic(), begin.affinity) else {
            debug!("{} stream {} has no route", P::NAME, initial_id);
            return false;
        };

        let mut client = RequestClient::new(cx, begin, protocol, address);
        self.by_network
            .insert(client.network.initial_id, initial_id);
        client.on_app_begin(cx);
        self.clients.insert(initial_id, client);
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        let stream_id = frame.stream_id();
        let app_id = match &frame {
            Frame::Signal(_) => stream_id,
            _ => self
                .by_network
                .get(&(stream_id | 1))
                .copied()
                .unwrap_or(stream_id | 1),
        };
        let Some(client) = self.clients.get_mut(&app_id) else {
            trace!("{} {} for unknown stream {}", P::NAME, frame.name(), stream_id);
            return;
        };

        match frame {
            Frame::Signal(signal) => client.on_signal(cx, signal),
            frame if (stream_id | 1) == client.network.initial_id => {
                client.on_network_frame(cx, frame)
            }
            frame => client.on_app_frame(cx, frame),
        }
        self.remove_if_closed(cx, app_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use bytes::BufMut;

    /// Frames a response body behind `length` and `correlation_id`.
    pub fn response(correlation_id: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(body.len() as i32 + 4);
        buf.put_i32(correlation_id);
        buf.put_slice(body);
        buf
    }

    pub fn context(now_ms: i64) -> DecodeContext {
        DecodeContext {
            now_ms,
            app_reply_budget: i32::MAX,
            app_reply_padding: 0,
        }
    }

    /// Runs protocol steps over `bytes` until they stop making progress.
    pub fn decode_all<P: RequestProtocol>(
        protocol: &mut P,
        mut step: Step<P::Step>,
        bytes: &[u8],
        dcx: &DecodeContext,
    ) -> (Step<P::Step>, usize, Vec<Effect>) {
        let mut progress = 0;
        let mut effects = Vec::new();
        while let Step::Protocol(current) = step {
            let mut r = WireReader::new(&bytes[progress..]);
            let mut step_effects = Vec::new();
            match protocol.decode(current, &mut r, dcx, &mut step_effects) {
                Ok(next) => {
                    progress += r.position();
                    effects.extend(step_effects);
                    if next == step && r.position() == 0 {
                        break;
                    }
                    step = next;
                }
                Err(e) if e.is_underrun() => break,
                Err(e) => panic!("decode failed: {}", e),
            }
        }
        (step, progress, effects)
    }
}
