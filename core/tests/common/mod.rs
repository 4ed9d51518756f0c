//! Scripted peers driving a whole engine with every gateway factory bound.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use fluxgate::engine::{Engine, ManualClock, StaticRoutes, CLIENT_BINDING};
use fluxgate::flow::BudgetCreditor;
use fluxgate::frame::{
    reply_id, Begin, BeginEx, Data, End, Frame, FrameHeader, KafkaBeginEx, ProxyBeginEx, Window,
    FLAGS_COMPLETE,
};
use fluxgate::net::bind_factories;
use fluxgate::protocol::kafka::codec::{put_nullable_string, put_string};
use fluxgate::protocol::kafka::{
    DescribeConfigsEntry, DescribeConfigsResource, DescribeConfigsResponse, RESOURCE_TYPE_TOPIC,
};
use fluxgate::{GatewayConfig, GatewayMetrics};
use std::sync::Arc;

pub const START_MS: i64 = 1_000_000;

pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    outbound: Vec<Frame>,
}

impl Harness {
    pub fn new(config: GatewayConfig) -> Self {
        let routes = StaticRoutes::from_config(&config).expect("routes");
        let clock = Arc::new(ManualClock::new(START_MS));
        let mut engine = Engine::new(
            0,
            Arc::new(config),
            Arc::new(routes),
            Arc::new(BudgetCreditor::new()),
            Arc::new(GatewayMetrics::new()),
            clock.clone(),
        );
        bind_factories(&mut engine);
        Self {
            engine,
            clock,
            outbound: Vec::new(),
        }
    }

    pub fn send(&mut self, frame: Frame) {
        self.engine.on_external(frame);
        self.collect();
    }

    pub fn advance(&mut self, delta_ms: i64) {
        self.clock.advance(delta_ms);
        self.engine.poll();
        self.collect();
    }

    /// Every frame written since the last call.
    pub fn take(&mut self) -> Vec<Frame> {
        self.collect();
        std::mem::take(&mut self.outbound)
    }

    /// Frames written on either half of `initial_id` since the last call.
    pub fn take_stream(&mut self, initial_id: u64) -> Vec<Frame> {
        self.collect();
        let (stream, rest) = std::mem::take(&mut self.outbound)
            .into_iter()
            .partition(|frame| frame.stream_id() | 1 == initial_id);
        self.outbound = rest;
        stream
    }

    /// Initial ids of the network streams begun since the last call.
    pub fn take_network_begins(&mut self) -> Vec<(u64, ProxyBeginEx)> {
        self.collect();
        let mut begins = Vec::new();
        self.outbound.retain(|frame| match frame {
            Frame::Begin(begin) => match begin.extension.proxy() {
                Some(address) => {
                    begins.push((begin.header.stream_id, address.clone()));
                    false
                }
                None => true,
            },
            _ => true,
        });
        begins
    }

    fn collect(&mut self) {
        let frames = self.engine.drain_outbound();
        self.outbound.extend(frames);
    }
}

/// Plays the broker side of one network stream.
pub struct BrokerPeer {
    pub initial_id: u64,
    reply_sequence: i64,
    received: BytesMut,
}

impl BrokerPeer {
    pub fn new(initial_id: u64) -> Self {
        Self {
            initial_id,
            reply_sequence: 0,
            received: BytesMut::new(),
        }
    }

    /// Opens the reply and grants `maximum` bytes of request credit.
    pub fn accept(&mut self, harness: &mut Harness, maximum: i32) {
        harness.send(Frame::Begin(Begin {
            header: FrameHeader::new(0, 0, reply_id(self.initial_id)),
            affinity: 0,
            extension: BeginEx::None,
        }));
        self.grant(harness, 0, maximum);
    }

    pub fn grant(&mut self, harness: &mut Harness, acknowledge: i64, maximum: i32) {
        harness.send(Frame::Window(Window {
            header: FrameHeader::new(0, 0, self.initial_id).window(0, acknowledge, maximum),
            budget_id: 0,
            padding: 0,
            minimum: 0,
        }));
    }

    /// Complete requests written so far on the network stream.
    pub fn requests(&mut self, harness: &mut Harness) -> Vec<Bytes> {
        for frame in harness.take_stream(self.initial_id) {
            if let Frame::Data(data) = frame {
                if data.header.stream_id == self.initial_id {
                    if let Some(payload) = data.payload {
                        self.received.extend_from_slice(&payload);
                    }
                }
            }
        }
        let mut requests = Vec::new();
        while self.received.len() >= 4 {
            let length = i32::from_be_bytes([
                self.received[0],
                self.received[1],
                self.received[2],
                self.received[3],
            ]) as usize;
            if self.received.len() < 4 + length {
                break;
            }
            requests.push(self.received.split_to(4 + length).freeze());
        }
        requests
    }

    /// Sends `bytes` on the reply, one Data frame per chunk.
    pub fn reply_chunks(&mut self, harness: &mut Harness, bytes: &[u8], cuts: &[usize]) {
        let mut start = 0;
        for end in cuts
            .iter()
            .copied()
            .filter(|cut| *cut > 0 && *cut < bytes.len())
            .chain(std::iter::once(bytes.len()))
        {
            if end <= start {
                continue;
            }
            let chunk = Bytes::copy_from_slice(&bytes[start..end]);
            let reserved = chunk.len() as i32;
            harness.send(Frame::Data(Data {
                header: FrameHeader::new(0, 0, reply_id(self.initial_id)).window(
                    self.reply_sequence,
                    0,
                    0,
                ),
                flags: FLAGS_COMPLETE,
                budget_id: 0,
                reserved,
                payload: Some(chunk),
                extension: None,
            }));
            self.reply_sequence += reserved as i64;
            start = end;
        }
    }

    pub fn reply(&mut self, harness: &mut Harness, bytes: &[u8]) {
        self.reply_chunks(harness, bytes, &[]);
    }

    pub fn end(&mut self, harness: &mut Harness) {
        harness.send(Frame::End(End {
            header: FrameHeader::new(0, 0, reply_id(self.initial_id)),
        }));
    }
}

pub fn describe_begin(stream_id: u64, topic: &str) -> Frame {
    Frame::Begin(Begin {
        header: FrameHeader::new(0, CLIENT_BINDING, stream_id),
        affinity: 0,
        extension: BeginEx::Kafka(KafkaBeginEx::Describe {
            topic: topic.to_string(),
            configs: vec!["retention.ms".to_string()],
        }),
    })
}

pub fn app_window(stream_id: u64, maximum: i32) -> Frame {
    Frame::Window(Window {
        header: FrameHeader::new(0, CLIENT_BINDING, stream_id).window(0, 0, maximum),
        budget_id: 0,
        padding: 0,
        minimum: 0,
    })
}

/// Frames a response body behind its length and correlation id.
pub fn response(correlation_id: i32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(body.len() as i32 + 4);
    buf.put_i32(correlation_id);
    buf.put_slice(body);
    buf.freeze()
}

pub fn correlation_id(request: &[u8]) -> i32 {
    i32::from_be_bytes([request[8], request[9], request[10], request[11]])
}

pub fn api_key(request: &[u8]) -> i16 {
    i16::from_be_bytes([request[4], request[5]])
}

/// Resource name of a DescribeConfigs v0 request.
pub fn describe_topic(request: &[u8]) -> String {
    let read_i16 = |at: usize| i16::from_be_bytes([request[at], request[at + 1]]);
    let client_id_length = read_i16(12).max(0) as usize;
    // resource count (i32) and resource type (i8) follow the client id
    let name_at = 14 + client_id_length + 4 + 1;
    let name_length = read_i16(name_at) as usize;
    String::from_utf8_lossy(&request[name_at + 2..name_at + 2 + name_length]).into_owned()
}

pub fn describe_body(topic: &str, retention: &str) -> Bytes {
    let message = DescribeConfigsResponse {
        throttle_time_ms: 0,
        resources: vec![DescribeConfigsResource {
            error_code: 0,
            error_message: None,
            resource_type: RESOURCE_TYPE_TOPIC,
            resource_name: topic.to_string(),
            configs: vec![DescribeConfigsEntry {
                name: "retention.ms".to_string(),
                value: Some(retention.to_string()),
                read_only: false,
                is_default: false,
                is_sensitive: false,
            }],
        }],
    };
    let mut buf = BytesMut::new();
    message.encode(&mut buf);
    buf.freeze()
}

pub fn sasl_handshake_body(error_code: i16, mechanisms: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(error_code);
    buf.put_i32(mechanisms.len() as i32);
    for mechanism in mechanisms {
        put_string(&mut buf, mechanism);
    }
    buf.freeze()
}

pub fn sasl_authenticate_body(error_code: i16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(error_code);
    put_nullable_string(&mut buf, None);
    buf.put_i32(0);
    buf.put_i64(0);
    buf.freeze()
}

pub fn offset_fetch_body(topic: &str, partitions: &[(i32, i64, i16)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(1);
    put_string(&mut buf, topic);
    buf.put_i32(partitions.len() as i32);
    for (index, offset, error_code) in partitions {
        buf.put_i32(*index);
        buf.put_i64(*offset);
        put_nullable_string(&mut buf, None);
        buf.put_i16(*error_code);
    }
    buf.freeze()
}
