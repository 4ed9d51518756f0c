//! # Connection Pool
//!
//! Request clients bound for the same broker share one network connection.
//! Every request gets a connection-wide correlation id, recorded in a FIFO
//! next to the stream that sent it; responses are deframed by their length
//! prefix and handed back to that stream with their own INIT/FIN bounds.
//!
//! Credit on the connection is shared through one budget: each connection
//! Window credits the budget by `(ack - old_ack) + (max - old_max)` and every
//! pooled stream is re-windowed against it.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

use crate::engine::{BindingKind, Context, StreamFactory, NETWORK_BINDING, POOL_BINDING};
use crate::flow::{StreamState, StreamWindow};
use crate::frame::{
    is_initial, reply_id, Begin, BeginEx, Data, Frame, FrameHeader, ProxyBeginEx, Window,
    FLAG_FIN, FLAG_INIT,
};

/// Fired once a connection has had no streams for `client_max_idle_ms`.
pub const SIGNAL_CONNECTION_IDLE: i32 = 1;

/// Request header: length, api key, api version, then the correlation id.
const REQUEST_CORRELATION_OFFSET: usize = 8;
/// Response prefix: length then correlation id.
const RESPONSE_PREFIX_SIZE: usize = 8;
/// The length field does not count itself.
const LENGTH_FIELD_SIZE: usize = 4;

/// Overwrites the correlation id bytes that fall inside `payload`, which
/// starts `position` bytes into its request.
fn rewrite_correlation(payload: &mut [u8], position: usize, correlation_id: i32) {
    let id = correlation_id.to_be_bytes();
    for (index, byte) in payload.iter_mut().enumerate() {
        let offset = position + index;
        if offset >= REQUEST_CORRELATION_OFFSET + id.len() {
            break;
        }
        if offset >= REQUEST_CORRELATION_OFFSET {
            *byte = id[offset - REQUEST_CORRELATION_OFFSET];
        }
    }
}

#[derive(Debug)]
struct PooledStream {
    origin_id: u64,
    routed_id: u64,
    initial_id: u64,
    affinity: u64,
    trace_id: u64,
    authorization: u64,
    connection_id: u64,
    state: StreamState,
    initial: StreamWindow,
    reply: StreamWindow,
    /// Bytes of the current request seen so far.
    request_position: usize,
    correlation_id: i32,
}

impl PooledStream {
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

    fn do_reply_begin(&mut self, cx: &mut Context<'_>) {
        self.state.open_reply();
        cx.begin(self.reply_header(), self.affinity, BeginEx::None);
    }

    fn do_initial_window_if_necessary(&mut self, cx: &mut Context<'_>, connection: &Connection) {
        if self.state.initial_closed() || connection.budget_id == 0 {
            return;
        }
        let opened = self.state.initial_opened();
        if self
            .initial
            .compute_credit(0, connection.initial.maximum, opened)
            .is_some()
        {
            self.state.opened_initial();
            cx.window(
                self.initial_header(),
                connection.budget_id,
                connection.initial.padding,
                connection.initial.minimum,
            );
        }
    }

    /// Returns `false` when the response overran the stream's reply window.
    fn do_reply_data(&mut self, cx: &mut Context<'_>, flags: u8, payload: Bytes) -> bool {
        if !self.state.reply_opening() || self.state.reply_closed() {
            return true;
        }
        let reserved = payload.len() as i32 + self.reply.padding;
        if reserved > self.reply.budget() {
            warn!(
                "pooled stream {} response overran its window ({} > {})",
                self.initial_id,
                reserved,
                self.reply.budget()
            );
            return false;
        }
        cx.data(self.reply_header(), flags, 0, reserved, Some(payload), None);
        self.reply.sent(reserved);
        true
    }

    fn do_reply_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.reply_opening() && !self.state.reply_closed() {
            self.state.close_reply();
            cx.end(self.reply_header());
        }
    }

    fn do_reply_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.reply_opening() && !self.state.reply_closed() {
            self.state.close_reply();
            cx.abort(self.reply_header());
        }
    }

    fn do_initial_reset_if_necessary(&mut self, cx: &mut Context<'_>) {
        if !self.state.initial_closed() {
            self.state.close_initial();
            cx.reset(self.initial_header(), None);
        }
    }

    fn cleanup(&mut self, cx: &mut Context<'_>) {
        self.do_initial_reset_if_necessary(cx);
        self.do_reply_abort_if_necessary(cx);
    }
}

#[derive(Debug)]
struct Response {
    /// `None` once the requesting stream is gone; the bytes are dropped.
    owner: Option<u64>,
    remaining: usize,
    init: bool,
}

#[derive(Debug)]
struct Connection {
    initial_id: u64,
    key: String,
    address: ProxyBeginEx,
    affinity: u64,
    state: StreamState,
    initial: StreamWindow,
    reply: StreamWindow,
    budget_id: u64,
    next_request_id: i32,
    correlations: VecDeque<(i32, u64)>,
    streams: Vec<u64>,
    /// Stream whose request is partially written to the connection.
    writer: Option<u64>,
    queued: VecDeque<(u64, Data)>,
    prefix: BytesMut,
    response: Option<Response>,
    idle_id: Option<u64>,
}

impl Connection {
    fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(POOL_BINDING, NETWORK_BINDING, self.initial_id).window(
            self.initial.sequence,
            self.initial.acknowledge,
            self.initial.maximum,
        )
    }

    fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(POOL_BINDING, NETWORK_BINDING, reply_id(self.initial_id)).window(
            self.reply.sequence,
            self.reply.acknowledge,
            self.reply.maximum,
        )
    }

    fn is_usable(&self) -> bool {
        !self.state.initial_closed() && !self.state.reply_closed()
    }

    fn do_begin(&mut self, cx: &mut Context<'_>) {
        self.state.open_initial();
        debug!(
            "pool connection {} opening to {}",
            self.initial_id,
            self.address.address()
        );
        cx.begin(
            self.initial_header(),
            self.affinity,
            BeginEx::Proxy(self.address.clone()),
        );
    }

    fn do_end_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.initial_opening() && !self.state.initial_closed() {
            self.state.close_initial();
            cx.end(self.initial_header());
        }
    }

    fn do_abort_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.initial_opening() && !self.state.initial_closed() {
            self.state.close_initial();
            cx.abort(self.initial_header());
        }
    }

    fn do_reset_if_necessary(&mut self, cx: &mut Context<'_>) {
        if self.state.reply_opening() && !self.state.reply_closed() {
            cx.reset(self.reply_header(), None);
        }
        self.state.close_reply();
    }

    fn take_correlation(&mut self, correlation_id: i32) -> Option<u64> {
        let index = self
            .correlations
            .iter()
            .position(|(id, _)| *id == correlation_id)?;
        self.correlations.remove(index).map(|(_, stream_id)| stream_id)
    }

    /// Forwards one request fragment, rewriting its correlation id.
    fn do_request_data(&mut self, cx: &mut Context<'_>, stream: &mut PooledStream, data: Data) {
        if data.is_init() {
            let request_id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            self.correlations.push_back((request_id, stream.initial_id));
            stream.request_position = 0;
            stream.correlation_id = request_id;
            trace!(
                "pool connection {} request {} from {}",
                self.initial_id,
                request_id,
                stream.initial_id
            );
        }

        let fin = data.is_fin();
        let payload = data.payload.unwrap_or_default();
        let mut buf = BytesMut::from(&payload[..]);
        rewrite_correlation(&mut buf, stream.request_position, stream.correlation_id);
        stream.request_position += buf.len();

        self.writer = if fin {
            None
        } else {
            Some(stream.initial_id)
        };
        cx.data(
            self.initial_header(),
            data.flags,
            self.budget_id,
            data.reserved,
            Some(buf.freeze()),
            None,
        );
        self.initial.sent(data.reserved);
    }

    /// Splits response bytes at their length prefixes and routes each
    /// response to the stream that sent the request. Returns the streams
    /// whose window was overrun, or `None` on a malformed length.
    fn on_response_bytes(
        &mut self,
        cx: &mut Context<'_>,
        streams: &mut HashMap<u64, PooledStream>,
        mut payload: Bytes,
    ) -> Option<Vec<u64>> {
        let mut overrun = Vec::new();
        while !payload.is_empty() {
            let mut chunk = BytesMut::new();
            if self.response.is_none() {
                let take = (RESPONSE_PREFIX_SIZE - self.prefix.len()).min(payload.len());
                self.prefix.extend_from_slice(&payload.split_to(take));
                if self.prefix.len() < RESPONSE_PREFIX_SIZE {
                    break;
                }
                let mut header = &self.prefix[..];
                let length = header.get_i32();
                let correlation_id = header.get_i32();
                if length < (RESPONSE_PREFIX_SIZE - LENGTH_FIELD_SIZE) as i32 {
                    warn!(
                        "pool connection {} response length {} invalid",
                        self.initial_id, length
                    );
                    return None;
                }
                let owner = self.take_correlation(correlation_id);
                if owner.is_none() {
                    debug!(
                        "pool connection {} dropping response {}",
                        self.initial_id, correlation_id
                    );
                }
                self.response = Some(Response {
                    owner,
                    remaining: length as usize + LENGTH_FIELD_SIZE - RESPONSE_PREFIX_SIZE,
                    init: true,
                });
                chunk.extend_from_slice(&self.prefix.split());
            }

            let Some(response) = self.response.as_mut() else {
                break;
            };
            let take = response.remaining.min(payload.len());
            chunk.extend_from_slice(&payload.split_to(take));
            response.remaining -= take;

            let mut flags = 0;
            if response.init {
                flags |= FLAG_INIT;
            }
            if response.remaining == 0 {
                flags |= FLAG_FIN;
            }
            response.init = false;
            let owner = response.owner;
            if response.remaining == 0 {
                self.response = None;
            }

            if let Some(stream) = owner.and_then(|id| streams.get_mut(&id)) {
                if !stream.do_reply_data(cx, flags, chunk.freeze()) {
                    overrun.push(stream.initial_id);
                    if let Some(response) = self.response.as_mut() {
                        response.owner = None;
                    }
                }
            }
        }
        Some(overrun)
    }
}

/// Multiplexes request-client network streams onto one connection per
/// broker address.
#[derive(Default)]
pub struct ConnectionPoolFactory {
    connections: HashMap<u64, Connection>,
    connections_by_address: HashMap<String, u64>,
    streams: HashMap<u64, PooledStream>,
}

impl ConnectionPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn supply_connection(
        &mut self,
        cx: &mut Context<'_>,
        address: &ProxyBeginEx,
        affinity: u64,
    ) -> u64 {
        let key = address.address();
        if let Some(connection_id) = self.connections_by_address.get(&key).copied() {
            match self.connections.get(&connection_id) {
                Some(connection) if connection.is_usable() => return connection_id,
                _ => {
                    self.connections_by_address.remove(&key);
                }
            }
        }

        let initial_id = cx.supply_initial_id();
        let mut connection = Connection {
            initial_id,
            key: key.clone(),
            address: address.clone(),
            affinity,
            state: StreamState::new(),
            initial: StreamWindow::new(),
            reply: StreamWindow::new(),
            budget_id: 0,
            next_request_id: 0,
            correlations: VecDeque::new(),
            streams: Vec::new(),
            writer: None,
            queued: VecDeque::new(),
            prefix: BytesMut::with_capacity(RESPONSE_PREFIX_SIZE),
            response: None,
            idle_id: None,
        };
        connection.do_begin(cx);
        self.connections.insert(initial_id, connection);
        self.connections_by_address.insert(key, initial_id);
        initial_id
    }

    /// Forwards queued request fragments, one request at a time.
    fn flush_queued(&mut self, cx: &mut Context<'_>, connection_id: u64) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if !connection.state.initial_opened() || connection.state.initial_closed() {
            return;
        }
        loop {
            let index = match connection.writer {
                None if connection.queued.is_empty() => break,
                None => 0,
                Some(writer) => match connection.queued.iter().position(|(id, _)| *id == writer) {
                    Some(index) => index,
                    None => break,
                },
            };
            let Some((stream_id, data)) = connection.queued.remove(index) else {
                break;
            };
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                connection.do_request_data(cx, stream, data);
            }
        }
    }

    fn do_connection_reply_window_if_necessary(&mut self, cx: &mut Context<'_>, connection_id: u64) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if !connection.state.reply_opening() || connection.state.reply_closed() {
            return;
        }
        let unacked: i64 = connection
            .streams
            .iter()
            .filter_map(|id| self.streams.get(id))
            .map(|stream| stream.reply.pending())
            .sum::<i64>()
            + connection.prefix.len() as i64;
        let maximum = cx.config().slot_capacity as i32;
        let opened = connection.state.reply_opened();
        if connection
            .reply
            .compute_credit(unacked, maximum, opened)
            .is_some()
        {
            connection.state.opened_reply();
            cx.window(connection.reply_header(), 0, 0, 0);
        }
    }

    fn on_stream_data(&mut self, cx: &mut Context<'_>, stream_id: u64, data: Data) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if let Err(e) = stream.initial.on_data(data.header.sequence, data.reserved) {
            warn!("pooled stream {} data rejected: {}", stream_id, e);
            stream.cleanup(cx);
            self.on_stream_closed(cx, stream_id);
            return;
        }
        let connection_id = stream.connection_id;
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };

        if data.is_skip() {
            if connection.budget_id != 0 && data.reserved > 0 {
                cx.credit_budget(connection.budget_id, data.reserved as i64);
            }
        } else {
            connection.queued.push_back((stream_id, data));
        }
        stream.do_initial_window_if_necessary(cx, connection);
        self.flush_queued(cx, connection_id);
    }

    fn on_stream_window(&mut self, cx: &mut Context<'_>, stream_id: u64, window: Window) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let header = window.header;
        if let Err(e) = stream.reply.apply_window(
            header.acknowledge,
            header.maximum,
            window.padding,
            window.minimum,
            window.budget_id,
        ) {
            warn!("pooled stream {} window rejected: {}", stream_id, e);
            stream.cleanup(cx);
            self.on_stream_closed(cx, stream_id);
            return;
        }
        stream.state.opened_reply();
        let connection_id = stream.connection_id;
        self.do_connection_reply_window_if_necessary(cx, connection_id);
    }

    fn on_stream_frame(&mut self, cx: &mut Context<'_>, stream_id: u64, frame: Frame) {
        match frame {
            Frame::Data(data) => self.on_stream_data(cx, stream_id, data),
            Frame::Window(window) => self.on_stream_window(cx, stream_id, window),
            Frame::End(_) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state.close_initial();
                    stream.do_reply_end_if_necessary(cx);
                }
                self.on_stream_closed(cx, stream_id);
            }
            Frame::Abort(_) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state.close_initial();
                    stream.do_reply_abort_if_necessary(cx);
                }
                self.on_stream_closed(cx, stream_id);
            }
            Frame::Reset(_) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.state.close_reply();
                    stream.do_initial_reset_if_necessary(cx);
                }
                self.on_stream_closed(cx, stream_id);
            }
            Frame::Begin(_) | Frame::Flush(_) | Frame::Signal(_) => {}
        }
    }

    fn on_stream_closed(&mut self, cx: &mut Context<'_>, stream_id: u64) {
        let Some(stream) = self.streams.remove(&stream_id) else {
            return;
        };
        let connection_id = stream.connection_id;
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        connection.streams.retain(|id| *id != stream_id);

        let mut refund = 0i64;
        connection.queued.retain(|(id, data)| {
            if *id == stream_id {
                refund += data.reserved as i64;
                false
            } else {
                true
            }
        });
        if refund > 0 && connection.budget_id != 0 {
            cx.credit_budget(connection.budget_id, refund);
        }

        if connection.writer == Some(stream_id) {
            warn!(
                "pool connection {} lost stream {} mid-request",
                connection_id, stream_id
            );
            self.close_connection(cx, connection_id, true);
            return;
        }

        if connection.streams.is_empty() {
            let deadline = cx.now() + cx.config().client_max_idle_ms;
            connection.idle_id = Some(cx.signal_at(
                deadline,
                connection_id,
                SIGNAL_CONNECTION_IDLE,
                0,
            ));
        }
        self.do_connection_reply_window_if_necessary(cx, connection_id);
        self.flush_queued(cx, connection_id);
    }

    fn on_connection_window(&mut self, cx: &mut Context<'_>, connection_id: u64, window: Window) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        let header = window.header;
        let credit = (header.acknowledge - connection.initial.acknowledge)
            + (header.maximum - connection.initial.maximum) as i64;
        if let Err(e) = connection.initial.apply_window(
            header.acknowledge,
            header.maximum,
            window.padding,
            window.minimum,
            window.budget_id,
        ) {
            warn!("pool connection {} window rejected: {}", connection_id, e);
            self.close_connection(cx, connection_id, true);
            return;
        }
        connection.state.opened_initial();

        if connection.budget_id == 0 {
            connection.budget_id = cx.creditor().supply_budget_id();
            cx.creditor().acquire(connection.budget_id);
        }
        if credit > 0 {
            cx.credit_budget(connection.budget_id, credit);
        }

        for stream_id in &connection.streams {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.do_initial_window_if_necessary(cx, connection);
            }
        }
        self.flush_queued(cx, connection_id);
    }

    fn on_connection_data(&mut self, cx: &mut Context<'_>, connection_id: u64, data: Data) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if let Err(e) = connection
            .reply
            .on_data(data.header.sequence, data.reserved)
        {
            warn!("pool connection {} data rejected: {}", connection_id, e);
            self.close_connection(cx, connection_id, true);
            return;
        }
        let payload = data.payload.unwrap_or_default();
        match connection.on_response_bytes(cx, &mut self.streams, payload) {
            Some(overrun) => {
                for stream_id in overrun {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.cleanup(cx);
                    }
                    self.on_stream_closed(cx, stream_id);
                }
                self.do_connection_reply_window_if_necessary(cx, connection_id);
            }
            None => self.close_connection(cx, connection_id, true),
        }
    }

    fn on_connection_frame(&mut self, cx: &mut Context<'_>, connection_id: u64, frame: Frame) {
        match frame {
            Frame::Begin(_) => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state.open_reply();
                }
                self.do_connection_reply_window_if_necessary(cx, connection_id);
            }
            Frame::Data(data) => self.on_connection_data(cx, connection_id, data),
            Frame::Window(window) => self.on_connection_window(cx, connection_id, window),
            Frame::End(_) => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state.close_reply();
                }
                self.close_connection(cx, connection_id, false);
            }
            Frame::Abort(_) => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state.close_reply();
                }
                self.close_connection(cx, connection_id, true);
            }
            Frame::Reset(_) => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state.close_initial();
                }
                self.close_connection(cx, connection_id, true);
            }
            Frame::Signal(signal) if signal.signal_id == SIGNAL_CONNECTION_IDLE => {
                let Some(connection) = self.connections.get_mut(&connection_id) else {
                    return;
                };
                connection.idle_id = None;
                if connection.streams.is_empty() {
                    debug!("pool connection {} idle, closing", connection_id);
                    self.close_connection(cx, connection_id, false);
                }
            }
            Frame::Flush(_) | Frame::Signal(_) => {}
        }
    }

    /// Closes the connection and cleans up every stream still on it.
    fn close_connection(&mut self, cx: &mut Context<'_>, connection_id: u64, abort: bool) {
        let Some(mut connection) = self.connections.remove(&connection_id) else {
            return;
        };
        if self.connections_by_address.get(&connection.key) == Some(&connection_id) {
            self.connections_by_address.remove(&connection.key);
        }
        if abort {
            connection.do_abort_if_necessary(cx);
        } else {
            connection.do_end_if_necessary(cx);
        }
        connection.do_reset_if_necessary(cx);
        if let Some(idle_id) = connection.idle_id.take() {
            cx.cancel(idle_id);
        }
        for stream_id in connection.streams {
            if let Some(mut stream) = self.streams.remove(&stream_id) {
                stream.cleanup(cx);
            }
        }
        if connection.budget_id != 0 {
            cx.creditor().release(connection.budget_id);
        }
        debug!("pool connection {} closed", connection_id);
    }
}

impl StreamFactory for ConnectionPoolFactory {
    fn kinds(&self) -> Vec<BindingKind> {
        vec![BindingKind::Network]
    }

    fn new_stream(&mut self, cx: &mut Context<'_>, begin: &Begin) -> bool {
        let header = begin.header;
        let stream_id = header.stream_id;
        if !is_initial(stream_id) || self.streams.contains_key(&stream_id) {
            return false;
        }
        let Some(address) = begin.extension.proxy() else {
            return false;
        };

        let connection_id = self.supply_connection(cx, address, begin.affinity);
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        if let Some(idle_id) = connection.idle_id.take() {
            cx.cancel(idle_id);
        }
        connection.streams.push(stream_id);

        let mut stream = PooledStream {
            origin_id: header.origin_id,
            routed_id: header.routed_id,
            initial_id: stream_id,
            affinity: begin.affinity,
            trace_id: header.trace_id,
            authorization: header.authorization,
            connection_id,
            state: StreamState::new(),
            initial: StreamWindow::new(),
            reply: StreamWindow::new(),
            request_position: 0,
            correlation_id: 0,
        };
        stream.state.open_initial();
        stream.do_reply_begin(cx);
        stream.do_initial_window_if_necessary(cx, connection);
        self.streams.insert(stream_id, stream);
        true
    }

    fn on_frame(&mut self, cx: &mut Context<'_>, frame: Frame) {
        let initial_id = frame.stream_id() | 1;
        if self.connections.contains_key(&initial_id) {
            self.on_connection_frame(cx, initial_id, frame);
        } else if self.streams.contains_key(&initial_id) {
            self.on_stream_frame(cx, initial_id, frame);
        } else {
            trace!("pool dropped {} for {}", frame.name(), frame.stream_id());
        }
    }
}
