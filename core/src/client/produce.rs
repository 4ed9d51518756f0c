//! Produce (v3) to one topic partition.
//!
//! The application writes each record as one or more Data frames: the
//! `INIT` fragment carries the record metadata, the `FIN` fragment completes
//! the value. Completed records are batched into the next request; the
//! broker's base offset is reported back as a Flush.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{complete, read_response, DecodeContext, Effect, RequestProtocol, Step};
use crate::config::GatewayConfig;
use crate::engine::BindingKind;
use crate::frame::{Begin, Data, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaKind, KafkaOffset};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::records::{encode_record_batch, Record};
use crate::protocol::kafka::{
    ProduceRequest, ProduceResponse, RequestHeader, WireReader, API_KEY_PRODUCE,
    API_VERSION_PRODUCE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStep {
    Response,
}

/// Record whose value is still arriving in fragments.
#[derive(Debug)]
struct Assembly {
    record: Record,
    value: Option<BytesMut>,
    reserved: i64,
}

pub struct ProduceProtocol {
    transaction: Option<String>,
    topic: String,
    partition_id: i32,
    assembly: Option<Assembly>,
    records: Vec<Record>,
    queued_reserved: i64,
    inflight_reserved: i64,
    unacked: i64,
}

impl ProduceProtocol {
    pub fn new(transaction: Option<String>, topic: String, partition_id: i32) -> Self {
        Self {
            transaction,
            topic,
            partition_id,
            assembly: None,
            records: Vec::new(),
            queued_reserved: 0,
            inflight_reserved: 0,
            unacked: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.records.len()
    }
}

impl RequestProtocol for ProduceProtocol {
    type Step = ProduceStep;

    const NAME: &'static str = "produce";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Produce)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Produce {
                transaction,
                topic,
                partition,
            } => Some(Self::new(
                transaction.clone(),
                topic.clone(),
                partition.partition_id,
            )),
            _ => None,
        }
    }

    fn opened(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::AppBegin(KafkaBeginEx::Produce {
            transaction: self.transaction.clone(),
            topic: self.topic.clone(),
            partition: KafkaOffset::new(self.partition_id, -1),
        }));
        effects.push(Effect::AppWindow);
    }

    fn on_app_data(&mut self, data: &Data, _effects: &mut Vec<Effect>) -> std::result::Result<(), i32> {
        if data.is_init() {
            let Some(KafkaDataEx::Produce {
                timestamp,
                key,
                headers,
                ..
            }) = &data.extension
            else {
                return Err(0);
            };
            self.assembly = Some(Assembly {
                record: Record {
                    offset: -1,
                    timestamp: *timestamp,
                    key: key.clone(),
                    value: None,
                    headers: headers.clone(),
                },
                value: None,
                reserved: 0,
            });
        }

        let Some(assembly) = self.assembly.as_mut() else {
            return Err(0);
        };
        if let Some(payload) = &data.payload {
            assembly
                .value
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(payload);
        }
        assembly.reserved += data.reserved as i64;
        self.unacked += data.reserved as i64;

        if data.is_fin() {
            if let Some(Assembly {
                mut record,
                value,
                reserved,
            }) = self.assembly.take()
            {
                record.value = value.map(BytesMut::freeze);
                self.records.push(record);
                self.queued_reserved += reserved;
            }
        }
        Ok(())
    }

    fn app_credit(&self, config: &GatewayConfig) -> i32 {
        config.slot_capacity as i32
    }

    fn app_unacked(&self) -> i64 {
        self.unacked
    }

    fn has_request(&self) -> bool {
        !self.records.is_empty()
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        let records = std::mem::take(&mut self.records);
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 0, &records);
        trace!(
            "produce {} records to {}-{}",
            records.len(),
            self.topic,
            self.partition_id
        );

        let request = ProduceRequest {
            transactional_id: self.transaction.clone(),
            // every request is paired with a response
            acks: if config.client_produce_acks == 0 {
                1
            } else {
                config.client_produce_acks
            },
            timeout_ms: config.client_produce_max_response_ms,
            topic: self.topic.clone(),
            partition: self.partition_id,
            records: Bytes::from(batch),
        };
        RequestHeader::new(API_KEY_PRODUCE, API_VERSION_PRODUCE, correlation_id)
            .with_client_id(Some(&config.client_id))
            .encode_with(buf, |buf| request.encode(buf));

        self.inflight_reserved = std::mem::take(&mut self.queued_reserved);
    }

    fn first_step(&self) -> ProduceStep {
        ProduceStep::Response
    }

    fn decode(
        &mut self,
        _step: ProduceStep,
        r: &mut WireReader<'_>,
        _dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<ProduceStep>> {
        let (_, mut body) = read_response(r, API_KEY_PRODUCE, API_VERSION_PRODUCE)?;
        let response = complete(ProduceResponse::decode(&mut body))?;

        let partition = response
            .topics
            .iter()
            .filter(|topic| topic.name == self.topic)
            .flat_map(|topic| topic.partitions.iter())
            .find(|partition| partition.partition == self.partition_id);
        let Some(partition) = partition else {
            return Ok(Step::Reject(0));
        };
        if partition.error_code != 0 {
            return Ok(Step::Reject(partition.error_code as i32));
        }

        self.unacked -= std::mem::take(&mut self.inflight_reserved);
        effects.push(Effect::AppFlush(Some(KafkaFlushEx::Produce {
            partition: KafkaOffset::new(self.partition_id, partition.base_offset),
            error: 0,
        })));
        effects.push(Effect::AppWindow);
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NextRequest);
        Ok(Step::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{context, decode_all, response};
    use crate::frame::{FrameHeader, FLAG_FIN, FLAG_INIT};
    use crate::protocol::kafka::records::decode_record_batch;
    use crate::protocol::kafka::{ProducePartitionResponse, ProduceTopicResponse};

    fn fragment(flags: u8, payload: &'static [u8], reserved: i32) -> Data {
        Data {
            header: FrameHeader::new(0, 1, 1),
            flags,
            budget_id: 0,
            reserved,
            payload: Some(Bytes::from_static(payload)),
            extension: (flags & FLAG_INIT != 0).then(|| KafkaDataEx::Produce {
                deferred: 0,
                timestamp: 1_000,
                key: Some(Bytes::from_static(b"k")),
                headers: Vec::new(),
            }),
        }
    }

    fn produce_response(error_code: i16, base_offset: i64) -> BytesMut {
        let mut body = BytesMut::new();
        ProduceResponse {
            topics: vec![ProduceTopicResponse {
                name: "events".to_string(),
                partitions: vec![ProducePartitionResponse {
                    partition: 2,
                    error_code,
                    base_offset,
                    log_append_time_ms: -1,
                }],
            }],
            throttle_time_ms: 0,
        }
        .encode(&mut body);
        response(0, &body)
    }

    #[test]
    fn test_fragments_assemble_one_record() {
        let mut protocol = ProduceProtocol::new(None, "events".to_string(), 2);
        protocol
            .on_app_data(&fragment(FLAG_INIT, b"hel", 3), &mut Vec::new())
            .unwrap();
        assert!(!protocol.has_request());
        protocol
            .on_app_data(&fragment(FLAG_FIN, b"lo", 2), &mut Vec::new())
            .unwrap();
        assert_eq!(protocol.queued(), 1);
        assert_eq!(protocol.app_unacked(), 5);

        let mut buf = BytesMut::new();
        protocol.encode_request(&GatewayConfig::default(), &mut buf, 0);
        assert!(!protocol.has_request());

        // records follow the 4 byte length of the records field
        let mut r = WireReader::new(&buf);
        RequestHeader::decode(&mut r).unwrap();
        r.nullable_string().unwrap();
        assert_eq!(r.i16().unwrap(), -1);
        r.i32().unwrap();
        r.array_len().unwrap();
        assert_eq!(r.string().unwrap(), "events");
        r.array_len().unwrap();
        assert_eq!(r.i32().unwrap(), 2);
        let records = r.bytes().unwrap();
        let (_, decoded) = decode_record_batch(&mut WireReader::new(&records)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].value.as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoded[0].key.as_deref(), Some(&b"k"[..]));
    }

    #[test]
    fn test_continuation_without_init_is_refused() {
        let mut protocol = ProduceProtocol::new(None, "events".to_string(), 2);
        assert_eq!(
            protocol.on_app_data(&fragment(FLAG_FIN, b"x", 1), &mut Vec::new()),
            Err(0)
        );
    }

    #[test]
    fn test_response_flushes_base_offset() {
        let mut protocol = ProduceProtocol::new(None, "events".to_string(), 2);
        protocol
            .on_app_data(&fragment(FLAG_INIT | FLAG_FIN, b"v", 1), &mut Vec::new())
            .unwrap();
        protocol.encode_request(&GatewayConfig::default(), &mut BytesMut::new(), 0);

        let (step, _, effects) = decode_all(
            &mut protocol,
            Step::Protocol(ProduceStep::Response),
            &produce_response(0, 77),
            &context(0),
        );
        assert_eq!(step, Step::Idle);
        assert_eq!(protocol.app_unacked(), 0);
        assert_eq!(
            effects[0],
            Effect::AppFlush(Some(KafkaFlushEx::Produce {
                partition: KafkaOffset::new(2, 77),
                error: 0,
            }))
        );
    }

    #[test]
    fn test_not_leader_rejects() {
        let mut protocol = ProduceProtocol::new(None, "events".to_string(), 2);
        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(ProduceStep::Response),
            &produce_response(6, -1),
            &context(0),
        );
        assert_eq!(step, Step::Reject(6));
    }
}
