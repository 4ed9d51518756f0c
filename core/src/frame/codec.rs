//! Binary frame codec.
//!
//! ```text
//! Frame => length:int32 typeId:int32 originId:int64 routedId:int64
//!          streamId:int64 sequence:int64 acknowledge:int64 maximum:int32
//!          traceId:int64 authorization:int64 <kind fields>
//! ```
//!
//! Extensions are carried as `int32` length prefixed octets, `-1` when absent.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{
    Abort, Begin, BeginEx, Data, End, Flush, Frame, FrameHeader, KafkaBeginEx, KafkaDataEx,
    KafkaFlushEx, KafkaResetEx, ProxyBeginEx, Reset, Signal, Window,
};
use crate::protocol::kafka::codec::{put_nullable_bytes, KafkaCodecError, WireReader};

pub const BEGIN_TYPE_ID: u32 = 0x0000_0001;
pub const DATA_TYPE_ID: u32 = 0x0000_0002;
pub const END_TYPE_ID: u32 = 0x0000_0003;
pub const ABORT_TYPE_ID: u32 = 0x0000_0004;
pub const FLUSH_TYPE_ID: u32 = 0x0000_0005;
pub const RESET_TYPE_ID: u32 = 0x4000_0001;
pub const WINDOW_TYPE_ID: u32 = 0x4000_0002;
pub const SIGNAL_TYPE_ID: u32 = 0x4000_0003;

const BEGIN_EX_NONE: i8 = 0;
const BEGIN_EX_KAFKA: i8 = 1;
const BEGIN_EX_PROXY: i8 = 2;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown frame type id: {0:#x}")]
    UnknownType(u32),
    #[error("Invalid frame length: {0}")]
    InvalidLength(i64),
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

impl From<KafkaCodecError> for FrameCodecError {
    fn from(e: KafkaCodecError) -> Self {
        FrameCodecError::Invalid(e.to_string())
    }
}

pub fn type_id(frame: &Frame) -> u32 {
    match frame {
        Frame::Begin(_) => BEGIN_TYPE_ID,
        Frame::Data(_) => DATA_TYPE_ID,
        Frame::End(_) => END_TYPE_ID,
        Frame::Abort(_) => ABORT_TYPE_ID,
        Frame::Flush(_) => FLUSH_TYPE_ID,
        Frame::Window(_) => WINDOW_TYPE_ID,
        Frame::Reset(_) => RESET_TYPE_ID,
        Frame::Signal(_) => SIGNAL_TYPE_ID,
    }
}

fn put_extension<F>(buf: &mut BytesMut, present: bool, encode: F)
where
    F: FnOnce(&mut BytesMut),
{
    if !present {
        buf.put_i32(-1);
        return;
    }
    let start = buf.len();
    buf.put_i32(0);
    encode(buf);
    let length = (buf.len() - start - 4) as i32;
    buf[start..start + 4].copy_from_slice(&length.to_be_bytes());
}

pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_i32(0);
    buf.put_u32(type_id(frame));

    let header = frame.header();
    buf.put_u64(header.origin_id);
    buf.put_u64(header.routed_id);
    buf.put_u64(header.stream_id);
    buf.put_i64(header.sequence);
    buf.put_i64(header.acknowledge);
    buf.put_i32(header.maximum);
    buf.put_u64(header.trace_id);
    buf.put_u64(header.authorization);

    match frame {
        Frame::Begin(begin) => {
            buf.put_u64(begin.affinity);
            match &begin.extension {
                BeginEx::None => buf.put_i8(BEGIN_EX_NONE),
                BeginEx::Kafka(ex) => {
                    buf.put_i8(BEGIN_EX_KAFKA);
                    put_extension(buf, true, |b| ex.encode(b));
                }
                BeginEx::Proxy(ex) => {
                    buf.put_i8(BEGIN_EX_PROXY);
                    put_extension(buf, true, |b| ex.encode(b));
                }
            }
        }
        Frame::Data(data) => {
            buf.put_u8(data.flags);
            buf.put_u64(data.budget_id);
            buf.put_i32(data.reserved);
            put_nullable_bytes(buf, data.payload.as_deref());
            put_extension(buf, data.extension.is_some(), |b| {
                if let Some(ex) = &data.extension {
                    ex.encode(b);
                }
            });
        }
        Frame::End(_) | Frame::Abort(_) => {}
        Frame::Flush(flush) => {
            buf.put_u64(flush.budget_id);
            buf.put_i32(flush.reserved);
            put_extension(buf, flush.extension.is_some(), |b| {
                if let Some(ex) = &flush.extension {
                    ex.encode(b);
                }
            });
        }
        Frame::Window(window) => {
            buf.put_u64(window.budget_id);
            buf.put_i32(window.padding);
            buf.put_i32(window.minimum);
        }
        Frame::Reset(reset) => {
            put_extension(buf, reset.extension.is_some(), |b| {
                if let Some(ex) = &reset.extension {
                    ex.encode(b);
                }
            });
        }
        Frame::Signal(signal) => {
            buf.put_u64(signal.cancel_id);
            buf.put_i32(signal.signal_id);
            buf.put_i32(signal.context_id);
        }
    }

    let length = (buf.len() - start - 4) as i32;
    buf[start..start + 4].copy_from_slice(&length.to_be_bytes());
}

fn read_extension<'a>(r: &mut WireReader<'a>) -> Result<Option<WireReader<'a>>, FrameCodecError> {
    let length = r.i32()?;
    if length == -1 {
        return Ok(None);
    }
    if length < 0 {
        return Err(FrameCodecError::InvalidLength(length as i64));
    }
    Ok(Some(WireReader::new(r.slice(length as usize)?)))
}

fn decode_body(buf: &[u8]) -> Result<Frame, FrameCodecError> {
    let mut r = WireReader::new(buf);
    let type_id = r.u32()?;
    let header = FrameHeader {
        origin_id: r.i64()? as u64,
        routed_id: r.i64()? as u64,
        stream_id: r.i64()? as u64,
        sequence: r.i64()?,
        acknowledge: r.i64()?,
        maximum: r.i32()?,
        trace_id: r.i64()? as u64,
        authorization: r.i64()? as u64,
    };

    let frame = match type_id {
        BEGIN_TYPE_ID => {
            let affinity = r.i64()? as u64;
            let extension = match r.i8()? {
                BEGIN_EX_NONE => BeginEx::None,
                BEGIN_EX_KAFKA => match read_extension(&mut r)? {
                    Some(mut ex) => BeginEx::Kafka(KafkaBeginEx::decode(&mut ex)?),
                    None => BeginEx::None,
                },
                BEGIN_EX_PROXY => match read_extension(&mut r)? {
                    Some(mut ex) => BeginEx::Proxy(ProxyBeginEx::decode(&mut ex)?),
                    None => BeginEx::None,
                },
                other => {
                    return Err(FrameCodecError::Invalid(format!(
                        "Unknown begin extension {}",
                        other
                    )))
                }
            };
            Frame::Begin(Begin {
                header,
                affinity,
                extension,
            })
        }
        DATA_TYPE_ID => {
            let flags = r.i8()? as u8;
            let budget_id = r.i64()? as u64;
            let reserved = r.i32()?;
            let payload = r.nullable_bytes()?;
            let extension = match read_extension(&mut r)? {
                Some(mut ex) => Some(KafkaDataEx::decode(&mut ex)?),
                None => None,
            };
            Frame::Data(Data {
                header,
                flags,
                budget_id,
                reserved,
                payload,
                extension,
            })
        }
        END_TYPE_ID => Frame::End(End { header }),
        ABORT_TYPE_ID => Frame::Abort(Abort { header }),
        FLUSH_TYPE_ID => {
            let budget_id = r.i64()? as u64;
            let reserved = r.i32()?;
            let extension = match read_extension(&mut r)? {
                Some(mut ex) => Some(KafkaFlushEx::decode(&mut ex)?),
                None => None,
            };
            Frame::Flush(Flush {
                header,
                budget_id,
                reserved,
                extension,
            })
        }
        WINDOW_TYPE_ID => Frame::Window(Window {
            header,
            budget_id: r.i64()? as u64,
            padding: r.i32()?,
            minimum: r.i32()?,
        }),
        RESET_TYPE_ID => {
            let extension = match read_extension(&mut r)? {
                Some(mut ex) => Some(KafkaResetEx::decode(&mut ex)?),
                None => None,
            };
            Frame::Reset(Reset { header, extension })
        }
        SIGNAL_TYPE_ID => Frame::Signal(Signal {
            header,
            cancel_id: r.i64()? as u64,
            signal_id: r.i32()?,
            context_id: r.i32()?,
        }),
        other => return Err(FrameCodecError::UnknownType(other)),
    };
    Ok(frame)
}

/// Decodes one frame from the front of `buf`, returning it with the bytes consumed.
///
/// Returns `Ok(None)` until the whole frame is available.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameCodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length < 0 || length as usize > MAX_FRAME_LENGTH {
        return Err(FrameCodecError::InvalidLength(length as i64));
    }
    let total = 4 + length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let frame = decode_body(&buf[4..total])?;
    Ok(Some((frame, total)))
}

/// Length prefixed frame codec for application connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_frame(src)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                trace!(
                    "FrameCodec: decoded {} stream={} ({} bytes)",
                    frame.name(),
                    frame.stream_id(),
                    consumed
                );
                Ok(Some(frame))
            }
            None => {
                if src.len() >= 4 {
                    let length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    let total = 4 + length.max(0) as usize;
                    if total > src.len() {
                        src.reserve(total - src.len());
                    }
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst);
        Ok(())
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst);
        Ok(())
    }
}

/// Encodes a frame into its own buffer.
pub fn to_bytes(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf);
    buf.freeze()
}
