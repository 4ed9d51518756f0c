//! Fetch (v5) from one topic partition, repeated from the next offset.
//!
//! Record batches are streamed record by record: each record becomes one
//! application Data frame, and decoding pauses (leaving the bytes in the
//! decode slot) while the application reply window cannot take the next
//! record. Compressed and control batches are skipped as a whole, and a
//! truncated trailing batch is skipped incrementally without buffering it.

use bytes::BytesMut;
use tracing::{debug, trace};

use super::{DecodeContext, Effect, RequestProtocol, Step};
use crate::cache::{OFFSET_EARLIEST, OFFSET_LATEST};
use crate::config::GatewayConfig;
use crate::engine::BindingKind;
use crate::frame::{
    Begin, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaKind, KafkaOffset, FLAGS_COMPLETE,
};
use crate::protocol::kafka::codec::Result;
use crate::protocol::kafka::records::{Record, RecordBatchHeader, RECORD_BATCH_HEADER_SIZE};
use crate::protocol::kafka::{
    FetchPartitionHeader, FetchRequest, FetchResponse, KafkaErrorCode, RequestHeader,
    ResponseHeader, TopicResponseHeader, WireReader, API_KEY_FETCH, API_VERSION_FETCH,
};

/// Topics and partitions still to decode after the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCursor {
    topics: usize,
    partitions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStep {
    Response,
    Topic {
        topics: usize,
    },
    Partition {
        cursor: FetchCursor,
    },
    /// Start of a record batch with `remaining` record set bytes left.
    Batch {
        remaining: usize,
        cursor: FetchCursor,
    },
    Record {
        batch: RecordBatchHeader,
        records: i32,
        batch_left: usize,
        remaining: usize,
        cursor: FetchCursor,
    },
    /// Discards `bytes`, then continues with the next batch.
    Skip {
        bytes: usize,
        remaining: usize,
        cursor: FetchCursor,
    },
}

pub struct FetchProtocol {
    topic: String,
    partition_id: i32,
    next_offset: i64,
    high_watermark: i64,
}

impl FetchProtocol {
    pub fn new(topic: String, partition_id: i32, offset: i64) -> Self {
        Self {
            topic,
            partition_id,
            next_offset: offset,
            high_watermark: -1,
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    fn fetch_offset(&self) -> i64 {
        match self.next_offset {
            OFFSET_EARLIEST | OFFSET_LATEST => 0,
            offset => offset.max(0),
        }
    }

    fn partition(&self, offset: i64) -> KafkaOffset {
        KafkaOffset {
            partition_id: self.partition_id,
            partition_offset: offset,
            latest_offset: self.high_watermark,
            metadata: None,
        }
    }

    fn next_partition(
        &mut self,
        cursor: FetchCursor,
        effects: &mut Vec<Effect>,
    ) -> Step<FetchStep> {
        if cursor.partitions > 1 {
            return Step::Protocol(FetchStep::Partition {
                cursor: FetchCursor {
                    partitions: cursor.partitions - 1,
                    ..cursor
                },
            });
        }
        self.next_topic(cursor.topics - 1, effects)
    }

    fn next_topic(&mut self, topics: usize, effects: &mut Vec<Effect>) -> Step<FetchStep> {
        if topics > 0 {
            return Step::Protocol(FetchStep::Topic { topics });
        }
        effects.push(Effect::AppFlush(Some(KafkaFlushEx::Fetch {
            partition: self.partition(self.next_offset),
        })));
        effects.push(Effect::ResponseComplete);
        effects.push(Effect::NextRequest);
        Step::Idle
    }

    fn skip(bytes: usize, remaining: usize, cursor: FetchCursor) -> Step<FetchStep> {
        Step::Protocol(FetchStep::Skip {
            bytes,
            remaining,
            cursor,
        })
    }

    fn decode_partition(
        &mut self,
        cursor: FetchCursor,
        r: &mut WireReader<'_>,
    ) -> Result<Step<FetchStep>> {
        let header = FetchPartitionHeader::decode(r)?;
        let records = header.records_size;

        if header.partition_index != self.partition_id {
            return Ok(Self::skip(records, 0, cursor));
        }

        match header.error_code {
            0 => {}
            code if code == KafkaErrorCode::OffsetOutOfRange.as_i16()
                && header.log_start_offset >= 0 =>
            {
                debug!(
                    "fetch {}-{} offset {} out of range, restarting at {}",
                    self.topic, self.partition_id, self.next_offset, header.log_start_offset
                );
                self.next_offset = header.log_start_offset;
                return Ok(Self::skip(records, 0, cursor));
            }
            code => return Ok(Step::Reject(code as i32)),
        }

        self.high_watermark = header.high_watermark;
        match self.next_offset {
            OFFSET_LATEST => {
                self.next_offset = header.high_watermark;
                Ok(Self::skip(records, 0, cursor))
            }
            OFFSET_EARLIEST => {
                self.next_offset = header.log_start_offset.max(0);
                Ok(Step::Protocol(FetchStep::Batch {
                    remaining: records,
                    cursor,
                }))
            }
            _ => Ok(Step::Protocol(FetchStep::Batch {
                remaining: records,
                cursor,
            })),
        }
    }

    fn decode_batch(
        &mut self,
        remaining: usize,
        cursor: FetchCursor,
        r: &mut WireReader<'_>,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<FetchStep>> {
        if remaining == 0 {
            return Ok(self.next_partition(cursor, effects));
        }
        if remaining < RECORD_BATCH_HEADER_SIZE {
            return Ok(Self::skip(remaining, 0, cursor));
        }

        let mut peek = r.clone();
        let batch = RecordBatchHeader::decode(&mut peek)?;
        let size = batch.size();
        if size > remaining {
            trace!("fetch {}-{} partial trailing batch", self.topic, self.partition_id);
            return Ok(Self::skip(remaining, 0, cursor));
        }
        if batch.is_opaque() || batch.record_count <= 0 || batch.next_offset() <= self.next_offset
        {
            self.next_offset = self.next_offset.max(batch.next_offset());
            return Ok(Self::skip(size, remaining - size, cursor));
        }

        *r = peek;
        Ok(Step::Protocol(FetchStep::Record {
            batch,
            records: batch.record_count,
            batch_left: size - RECORD_BATCH_HEADER_SIZE,
            remaining: remaining - size,
            cursor,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_record(
        &mut self,
        batch: RecordBatchHeader,
        records: i32,
        batch_left: usize,
        remaining: usize,
        cursor: FetchCursor,
        r: &mut WireReader<'_>,
        dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<FetchStep>> {
        if records == 0 || batch_left == 0 {
            self.next_offset = self.next_offset.max(batch.next_offset());
            return Ok(Self::skip(batch_left, remaining, cursor));
        }

        let current = FetchStep::Record {
            batch,
            records,
            batch_left,
            remaining,
            cursor,
        };
        let mut peek = r.clone();
        let record = Record::decode(&mut peek, &batch)?;
        let consumed = peek.position() - r.position();

        if record.offset >= self.next_offset {
            let length = record.value.as_ref().map_or(0, |value| value.len());
            if !dcx.fits(length) {
                return Ok(Step::Protocol(current));
            }
            self.next_offset = record.offset + 1;
            effects.push(Effect::AppData {
                flags: FLAGS_COMPLETE,
                payload: record.value,
                extension: Some(KafkaDataEx::Fetch {
                    deferred: 0,
                    timestamp: record.timestamp,
                    partition: self.partition(record.offset),
                    key: record.key,
                    headers: record.headers,
                }),
            });
        }

        *r = peek;
        Ok(Step::Protocol(FetchStep::Record {
            batch,
            records: records - 1,
            batch_left: batch_left.saturating_sub(consumed),
            remaining,
            cursor,
        }))
    }
}

impl RequestProtocol for FetchProtocol {
    type Step = FetchStep;

    const NAME: &'static str = "fetch";

    fn kinds() -> Vec<BindingKind> {
        vec![BindingKind::Kafka(KafkaKind::Fetch)]
    }

    fn open(_config: &GatewayConfig, _begin: &Begin, ex: &KafkaBeginEx) -> Option<Self> {
        match ex {
            KafkaBeginEx::Fetch { topic, partition } => Some(Self::new(
                topic.clone(),
                partition.partition_id,
                partition.partition_offset,
            )),
            _ => None,
        }
    }

    fn opened(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::AppBegin(KafkaBeginEx::Fetch {
            topic: self.topic.clone(),
            partition: self.partition(self.next_offset),
        }));
        effects.push(Effect::AppWindow);
    }

    fn has_request(&self) -> bool {
        true
    }

    fn encode_request(&mut self, config: &GatewayConfig, buf: &mut BytesMut, correlation_id: i32) {
        let request = FetchRequest {
            max_wait_ms: config.client_fetch_max_wait_ms,
            min_bytes: 1,
            max_bytes: config.client_fetch_max_bytes,
            isolation_level: 0,
            topic: self.topic.clone(),
            partition: self.partition_id,
            fetch_offset: self.fetch_offset(),
            log_start_offset: -1,
            partition_max_bytes: config.client_fetch_partition_max_bytes,
        };
        RequestHeader::new(API_KEY_FETCH, API_VERSION_FETCH, correlation_id)
            .with_client_id(Some(&config.client_id))
            .encode_with(buf, |buf| request.encode(buf));
    }

    fn first_step(&self) -> FetchStep {
        FetchStep::Response
    }

    fn decode(
        &mut self,
        step: FetchStep,
        r: &mut WireReader<'_>,
        dcx: &DecodeContext,
        effects: &mut Vec<Effect>,
    ) -> Result<Step<FetchStep>> {
        match step {
            FetchStep::Response => {
                ResponseHeader::decode_for(r, API_KEY_FETCH, API_VERSION_FETCH)?;
                let response = FetchResponse::decode(r)?;
                Ok(self.next_topic(response.topic_count, effects))
            }
            FetchStep::Topic { topics } => {
                let topic = TopicResponseHeader::decode(r)?;
                if topic.name != self.topic {
                    debug!("fetch for {} answered {}", self.topic, topic.name);
                    return Ok(Step::Reject(0));
                }
                match topic.partition_count {
                    0 => Ok(self.next_topic(topics - 1, effects)),
                    partitions => Ok(Step::Protocol(FetchStep::Partition {
                        cursor: FetchCursor { topics, partitions },
                    })),
                }
            }
            FetchStep::Partition { cursor } => self.decode_partition(cursor, r),
            FetchStep::Batch { remaining, cursor } => {
                self.decode_batch(remaining, cursor, r, effects)
            }
            FetchStep::Record {
                batch,
                records,
                batch_left,
                remaining,
                cursor,
            } => self.decode_record(batch, records, batch_left, remaining, cursor, r, dcx, effects),
            FetchStep::Skip {
                bytes,
                remaining,
                cursor,
            } => {
                let available = bytes.min(r.remaining());
                r.skip(available)?;
                match bytes - available {
                    0 => Ok(Step::Protocol(FetchStep::Batch { remaining, cursor })),
                    bytes => Ok(Self::skip(bytes, remaining, cursor)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{context, decode_all, response};
    use crate::protocol::kafka::codec::put_string;
    use crate::protocol::kafka::records::encode_record_batch;
    use bytes::{BufMut, Bytes};

    fn record(value: &'static [u8]) -> Record {
        Record::new(None, Some(Bytes::from_static(value)))
    }

    fn body(error_code: i16, log_start_offset: i64, records: &[u8]) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(0);
        body.put_i32(1);
        put_string(&mut body, "events");
        body.put_i32(1);
        FetchPartitionHeader {
            partition_index: 0,
            error_code,
            high_watermark: 20,
            last_stable_offset: 20,
            log_start_offset,
            records_size: records.len(),
        }
        .encode(&mut body);
        body.put_slice(records);
        response(0, &body)
    }

    fn values(effects: &[Effect]) -> Vec<Bytes> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::AppData { payload, .. } => payload.clone(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_records_become_data() {
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 10, &[record(b"a"), record(b"bb")]);
        let bytes = body(0, 0, &batch);

        let mut protocol = FetchProtocol::new("events".to_string(), 0, 10);
        let (step, progress, effects) =
            decode_all(&mut protocol, Step::Protocol(FetchStep::Response), &bytes, &context(0));
        assert_eq!(step, Step::Idle);
        assert_eq!(progress, bytes.len());
        assert_eq!(values(&effects), vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")]);
        assert_eq!(protocol.next_offset(), 12);
        assert!(effects.contains(&Effect::NextRequest));
    }

    #[test]
    fn test_already_delivered_records_are_skipped() {
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 10, &[record(b"a"), record(b"b"), record(b"c")]);
        let bytes = body(0, 0, &batch);

        let mut protocol = FetchProtocol::new("events".to_string(), 0, 11);
        let (_, _, effects) =
            decode_all(&mut protocol, Step::Protocol(FetchStep::Response), &bytes, &context(0));
        assert_eq!(values(&effects), vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[test]
    fn test_pauses_without_app_credit() {
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 0, &[record(b"hello")]);
        let bytes = body(0, 0, &batch);

        let mut protocol = FetchProtocol::new("events".to_string(), 0, 0);
        let mut dcx = context(0);
        dcx.app_reply_budget = 4;
        let (step, progress, effects) =
            decode_all(&mut protocol, Step::Protocol(FetchStep::Response), &bytes, &dcx);
        assert!(matches!(step, Step::Protocol(FetchStep::Record { .. })));
        assert!(values(&effects).is_empty());

        dcx.app_reply_budget = 5;
        let (step, rest, effects) = decode_all(&mut protocol, step, &bytes[progress..], &dcx);
        assert_eq!(step, Step::Idle);
        assert_eq!(progress + rest, bytes.len());
        assert_eq!(values(&effects), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_truncated_trailing_batch_is_skipped() {
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 0, &[record(b"a")]);
        let mut partial = BytesMut::new();
        encode_record_batch(&mut partial, 1, &[record(b"never")]);
        batch.put_slice(&partial[..partial.len() - 3]);
        let bytes = body(0, 0, &batch);

        let mut protocol = FetchProtocol::new("events".to_string(), 0, 0);
        let (step, progress, effects) =
            decode_all(&mut protocol, Step::Protocol(FetchStep::Response), &bytes, &context(0));
        assert_eq!(step, Step::Idle);
        assert_eq!(progress, bytes.len());
        assert_eq!(values(&effects), vec![Bytes::from_static(b"a")]);
        assert_eq!(protocol.next_offset(), 1);
    }

    #[test]
    fn test_latest_starts_at_high_watermark() {
        let mut batch = BytesMut::new();
        encode_record_batch(&mut batch, 0, &[record(b"old")]);
        let bytes = body(0, 0, &batch);

        let mut protocol = FetchProtocol::new("events".to_string(), 0, OFFSET_LATEST);
        assert_eq!(protocol.fetch_offset(), 0);
        let (_, _, effects) =
            decode_all(&mut protocol, Step::Protocol(FetchStep::Response), &bytes, &context(0));
        assert!(values(&effects).is_empty());
        assert_eq!(protocol.next_offset(), 20);
    }

    #[test]
    fn test_out_of_range_restarts_at_log_start() {
        let mut protocol = FetchProtocol::new("events".to_string(), 0, 5);
        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(FetchStep::Response),
            &body(1, 8, &[]),
            &context(0),
        );
        assert_eq!(step, Step::Idle);
        assert_eq!(protocol.next_offset(), 8);

        let (step, _, _) = decode_all(
            &mut protocol,
            Step::Protocol(FetchStep::Response),
            &body(6, -1, &[]),
            &context(0),
        );
        assert_eq!(step, Step::Reject(6));
    }
}
