//! Record batch (magic v2) encoding for Produce and Fetch.
//!
//! ```text
//! RecordBatch => baseOffset:int64 batchLength:int32 partitionLeaderEpoch:int32
//!                magic:int8 crc:uint32 attributes:int16 lastOffsetDelta:int32
//!                baseTimestamp:int64 maxTimestamp:int64 producerId:int64
//!                producerEpoch:int16 baseSequence:int32 records:[Record]
//! ```
//!
//! The CRC-32C covers everything from `attributes` to the end of the batch.
//! Only uncompressed batches are produced; compressed and control batches are
//! skipped when fetched.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{put_varint, put_varint_bytes, put_varlong, KafkaCodecError, Result, WireReader};

pub const RECORD_BATCH_MAGIC: i8 = 2;

/// Size of the batch header up to and including the record count.
pub const RECORD_BATCH_HEADER_SIZE: usize = 61;

/// `baseOffset` and `batchLength` precede the part counted by `batchLength`.
pub const RECORD_BATCH_LENGTH_OFFSET: usize = 12;

const CRC_OFFSET: usize = 17;
const ATTRIBUTES_OFFSET: usize = 21;

const ATTRIBUTE_COMPRESSION_MASK: i16 = 0x07;
const ATTRIBUTE_CONTROL: i16 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Option<Bytes>)>,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            key,
            value,
            ..Default::default()
        }
    }

    fn encode_body(&self, buf: &mut BytesMut, timestamp_delta: i64, offset_delta: i32) {
        buf.put_i8(0);
        put_varlong(buf, timestamp_delta);
        put_varint(buf, offset_delta);
        put_varint_bytes(buf, self.key.as_deref());
        put_varint_bytes(buf, self.value.as_deref());
        put_varint(buf, self.headers.len() as i32);
        for (name, value) in &self.headers {
            put_varint_bytes(buf, Some(name.as_bytes()));
            put_varint_bytes(buf, value.as_deref());
        }
    }

    /// Reads one record of a batch, resolving offset and timestamp deltas.
    pub fn decode(r: &mut WireReader<'_>, batch: &RecordBatchHeader) -> Result<Self> {
        let length = r.varint()?;
        if length < 0 {
            return Err(KafkaCodecError::invalid(format!(
                "Invalid record length {}",
                length
            )));
        }
        let body = r.slice(length as usize)?;
        let mut r = WireReader::new(body);
        let _attributes = r.i8()?;
        let timestamp_delta = r.varlong()?;
        let offset_delta = r.varint()?;
        let key = r.varint_bytes()?;
        let value = r.varint_bytes()?;
        let header_count = r.varint()?.max(0) as usize;
        let mut headers = Vec::with_capacity(header_count.min(16));
        for _ in 0..header_count {
            let name = r.varint_bytes()?.unwrap_or_default();
            let name = String::from_utf8(name.to_vec())
                .map_err(|e| KafkaCodecError::invalid(format!("Invalid header name: {}", e)))?;
            headers.push((name, r.varint_bytes()?));
        }
        Ok(Self {
            offset: batch.base_offset + offset_delta as i64,
            timestamp: batch.base_timestamp + timestamp_delta,
            key,
            value,
            headers,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBatchHeader {
    pub base_offset: i64,
    pub batch_length: i32,
    pub magic: i8,
    pub crc: u32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub record_count: i32,
}

impl RecordBatchHeader {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let base_offset = r.i64()?;
        let batch_length = r.i32()?;
        let _leader_epoch = r.i32()?;
        let magic = r.i8()?;
        let crc = r.u32()?;
        let attributes = r.i16()?;
        let last_offset_delta = r.i32()?;
        let base_timestamp = r.i64()?;
        let _max_timestamp = r.i64()?;
        let _producer_id = r.i64()?;
        let _producer_epoch = r.i16()?;
        let _base_sequence = r.i32()?;
        let record_count = r.i32()?;
        if batch_length < (RECORD_BATCH_HEADER_SIZE - RECORD_BATCH_LENGTH_OFFSET) as i32 {
            return Err(KafkaCodecError::invalid(format!(
                "Invalid batch length {}",
                batch_length
            )));
        }
        Ok(Self {
            base_offset,
            batch_length,
            magic,
            crc,
            attributes,
            last_offset_delta,
            base_timestamp,
            record_count,
        })
    }

    /// Whole batch size including `baseOffset` and `batchLength`.
    pub fn size(&self) -> usize {
        RECORD_BATCH_LENGTH_OFFSET + self.batch_length as usize
    }

    /// Batches the gateway cannot expand record by record.
    pub fn is_opaque(&self) -> bool {
        self.magic != RECORD_BATCH_MAGIC
            || self.attributes & ATTRIBUTE_COMPRESSION_MASK != 0
            || self.attributes & ATTRIBUTE_CONTROL != 0
    }

    pub fn next_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64 + 1
    }
}

/// Encodes an uncompressed batch; record offsets become deltas from `base_offset`.
pub fn encode_record_batch(buf: &mut BytesMut, base_offset: i64, records: &[Record]) {
    let start = buf.len();
    let base_timestamp = records.first().map(|r| r.timestamp).unwrap_or_default();
    let max_timestamp = records
        .iter()
        .map(|r| r.timestamp)
        .max()
        .unwrap_or(base_timestamp);

    buf.put_i64(base_offset);
    buf.put_i32(0);
    buf.put_i32(-1);
    buf.put_i8(RECORD_BATCH_MAGIC);
    buf.put_u32(0);
    buf.put_i16(0);
    buf.put_i32(records.len().saturating_sub(1) as i32);
    buf.put_i64(base_timestamp);
    buf.put_i64(max_timestamp);
    buf.put_i64(-1);
    buf.put_i16(-1);
    buf.put_i32(-1);
    buf.put_i32(records.len() as i32);

    let mut body = BytesMut::new();
    for (delta, record) in records.iter().enumerate() {
        body.clear();
        record.encode_body(&mut body, record.timestamp - base_timestamp, delta as i32);
        put_varint(buf, body.len() as i32);
        buf.put_slice(&body);
    }

    let batch_length = (buf.len() - start - RECORD_BATCH_LENGTH_OFFSET) as i32;
    buf[start + 8..start + 12].copy_from_slice(&batch_length.to_be_bytes());
    let crc = crc32c::crc32c(&buf[start + ATTRIBUTES_OFFSET..]);
    buf[start + CRC_OFFSET..start + ATTRIBUTES_OFFSET].copy_from_slice(&crc.to_be_bytes());
}

/// Decodes a complete batch, checking its CRC.
pub fn decode_record_batch(r: &mut WireReader<'_>) -> Result<(RecordBatchHeader, Vec<Record>)> {
    let mut peek = r.clone();
    let header = RecordBatchHeader::decode(&mut peek)?;
    let batch = r.slice(header.size())?;

    let computed = crc32c::crc32c(&batch[ATTRIBUTES_OFFSET..]);
    if computed != header.crc {
        return Err(KafkaCodecError::invalid(format!(
            "CRC mismatch: expected {:#x}, computed {:#x}",
            header.crc, computed
        )));
    }

    let mut records = Vec::new();
    if !header.is_opaque() {
        let mut body = WireReader::new(&batch[RECORD_BATCH_HEADER_SIZE..]);
        for _ in 0..header.record_count {
            records.push(Record::decode(&mut body, &header)?);
        }
    }
    Ok((header, records))
}
