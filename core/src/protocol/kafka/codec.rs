//! Kafka Wire Protocol Codec
//!
//! Primitive readers and writers for the Kafka binary format:
//! - All integers are encoded in network byte order (big-endian)
//! - Strings are length-prefixed with int16 length
//! - Arrays are length-prefixed with int32 length
//! - Nullable fields use -1 to indicate null
//! - Flexible versions use unsigned varint lengths (+1) and tagged fields
//!
//! Reading never blocks and never consumes past the end of the window it was
//! given. Running out of bytes yields [`KafkaCodecError::BufferUnderrun`],
//! which callers turn into "need more data" with [`partial`]. Every other
//! error is a structural violation of the protocol.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KafkaCodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported API version: key={0}, version={1}")]
    UnsupportedVersion(i16, i16),
    #[error("Unsupported API key: {0}")]
    UnsupportedApiKey(i16),
    #[error("Buffer underrun: needed {needed}, available {available}")]
    BufferUnderrun { needed: usize, available: usize },
}

impl KafkaCodecError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        KafkaCodecError::InvalidFormat(message.into())
    }

    pub fn is_underrun(&self) -> bool {
        matches!(self, KafkaCodecError::BufferUnderrun { .. })
    }
}

pub type Result<T> = std::result::Result<T, KafkaCodecError>;

/// Turns a buffer underrun into `Ok(None)`, keeping structural errors.
pub fn partial<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(KafkaCodecError::BufferUnderrun { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Bounds-checked big-endian reader over a borrowed byte window.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.position
    }

    fn need(&self, needed: usize) -> Result<()> {
        let available = self.remaining();
        if needed > available {
            return Err(KafkaCodecError::BufferUnderrun { needed, available });
        }
        Ok(())
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let start = self.position;
        self.position += len;
        Ok(&self.buf[start..start + len])
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.slice(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(i8::from_be_bytes(self.array::<1>()?))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.i8()? != 0)
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.array::<2>()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array::<4>()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array::<8>()?))
    }

    fn utf8(bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| KafkaCodecError::invalid(format!("Invalid UTF-8: {}", e)))
    }

    /// int16-prefixed string, null not allowed.
    pub fn string(&mut self) -> Result<String> {
        match self.nullable_string()? {
            Some(s) => Ok(s),
            None => Err(KafkaCodecError::invalid("Expected non-null string")),
        }
    }

    pub fn nullable_string(&mut self) -> Result<Option<String>> {
        let len = self.i16()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(KafkaCodecError::invalid(format!(
                "Invalid string length {}",
                len
            )));
        }
        let bytes = self.slice(len as usize)?;
        Self::utf8(bytes).map(Some)
    }

    /// int32-prefixed bytes, null not allowed.
    pub fn bytes(&mut self) -> Result<Bytes> {
        match self.nullable_bytes()? {
            Some(b) => Ok(b),
            None => Err(KafkaCodecError::invalid("Expected non-null bytes")),
        }
    }

    pub fn nullable_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(KafkaCodecError::invalid(format!(
                "Invalid bytes length {}",
                len
            )));
        }
        let bytes = self.slice(len as usize)?;
        Ok(Some(Bytes::copy_from_slice(bytes)))
    }

    /// int32 array length; null arrays read as empty.
    pub fn array_len(&mut self) -> Result<usize> {
        let len = self.i32()?;
        if len == -1 {
            return Ok(0);
        }
        if len < 0 {
            return Err(KafkaCodecError::invalid(format!(
                "Invalid array length {}",
                len
            )));
        }
        Ok(len as usize)
    }

    pub fn unsigned_varint(&mut self) -> Result<u32> {
        let mut result = 0u32;
        let mut shift = 0;
        loop {
            if shift > 28 {
                return Err(KafkaCodecError::invalid("Varint too large"));
            }
            let byte = self.i8()? as u8;
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn unsigned_varlong(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            if shift > 63 {
                return Err(KafkaCodecError::invalid("Varlong too large"));
            }
            let byte = self.i8()? as u8;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Zigzag encoded signed varint, as used inside record batches.
    pub fn varint(&mut self) -> Result<i32> {
        let raw = self.unsigned_varint()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    pub fn varlong(&mut self) -> Result<i64> {
        let raw = self.unsigned_varlong()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// Varint-prefixed nullable bytes, as used by record keys and values.
    pub fn varint_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.varint()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.slice(len as usize)?;
        Ok(Some(Bytes::copy_from_slice(bytes)))
    }

    pub fn compact_nullable_string(&mut self) -> Result<Option<String>> {
        let len = self.unsigned_varint()?;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.slice(len as usize - 1)?;
        Self::utf8(bytes).map(Some)
    }

    pub fn compact_string(&mut self) -> Result<String> {
        match self.compact_nullable_string()? {
            Some(s) => Ok(s),
            None => Err(KafkaCodecError::invalid("Expected non-null compact string")),
        }
    }

    pub fn compact_array_len(&mut self) -> Result<usize> {
        let len = self.unsigned_varint()?;
        Ok(len.saturating_sub(1) as usize)
    }

    pub fn skip_tagged_fields(&mut self) -> Result<()> {
        let count = self.unsigned_varint()?;
        for _ in 0..count {
            let _tag = self.unsigned_varint()?;
            let size = self.unsigned_varint()?;
            self.skip(size as usize)?;
        }
        Ok(())
    }
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

pub fn put_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => put_string(buf, s),
        None => buf.put_i16(-1),
    }
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

pub fn put_nullable_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => put_bytes(buf, bytes),
        None => buf.put_i32(-1),
    }
}

pub fn put_unsigned_varint(buf: &mut BytesMut, value: u32) {
    let mut value = value;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn put_unsigned_varlong(buf: &mut BytesMut, value: u64) {
    let mut value = value;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn put_varint(buf: &mut BytesMut, value: i32) {
    put_unsigned_varint(buf, ((value << 1) ^ (value >> 31)) as u32);
}

pub fn put_varlong(buf: &mut BytesMut, value: i64) {
    put_unsigned_varlong(buf, ((value << 1) ^ (value >> 63)) as u64);
}

pub fn put_varint_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            put_varint(buf, bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => put_varint(buf, -1),
    }
}

/// Number of bytes `put_varint` writes for `value`.
pub fn varint_size(value: i32) -> usize {
    let mut raw = ((value << 1) ^ (value >> 31)) as u32;
    let mut size = 1;
    while raw >= 0x80 {
        raw >>= 7;
        size += 1;
    }
    size
}

pub fn put_compact_string(buf: &mut BytesMut, s: &str) {
    put_unsigned_varint(buf, s.len() as u32 + 1);
    buf.put_slice(s.as_bytes());
}

pub fn put_compact_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => put_compact_string(buf, s),
        None => put_unsigned_varint(buf, 0),
    }
}

pub fn put_compact_array_len(buf: &mut BytesMut, len: usize) {
    put_unsigned_varint(buf, len as u32 + 1);
}

pub fn put_empty_tagged_fields(buf: &mut BytesMut) {
    buf.put_u8(0);
}
