//! # Transport Frames
//!
//! Streams are pairs of halves. The *initial* half carries Begin, Data, End,
//! Abort and Flush from the initiator to the acceptor while the acceptor
//! answers with Window and Reset on the same id. The *reply* half (id
//! `initial ^ 1`) mirrors this in the opposite direction.
//!
//! `sequence` counts bytes reserved by the sender, `acknowledge` and
//! `maximum` describe the receiver's credit window.

pub mod codec;
pub mod extension;

use bytes::Bytes;

pub use codec::{decode_frame, encode_frame, FrameCodec, FrameCodecError};
pub use extension::*;

/// Last fragment of a message.
pub const FLAG_FIN: u8 = 0x01;
/// First fragment of a message.
pub const FLAG_INIT: u8 = 0x02;
/// Frame is not counted towards a request boundary.
pub const FLAG_SKIP: u8 = 0x08;

/// A message carried in a single Data frame.
pub const FLAGS_COMPLETE: u8 = FLAG_INIT | FLAG_FIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: i64,
    pub acknowledge: i64,
    pub maximum: i32,
    pub trace_id: u64,
    pub authorization: u64,
}

impl FrameHeader {
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            stream_id,
            ..Default::default()
        }
    }

    pub fn window(mut self, sequence: i64, acknowledge: i64, maximum: i32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    pub fn trace(mut self, trace_id: u64, authorization: u64) -> Self {
        self.trace_id = trace_id;
        self.authorization = authorization;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginEx {
    None,
    Kafka(KafkaBeginEx),
    Proxy(ProxyBeginEx),
}

impl BeginEx {
    pub fn kafka(&self) -> Option<&KafkaBeginEx> {
        match self {
            BeginEx::Kafka(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn proxy(&self) -> Option<&ProxyBeginEx> {
        match self {
            BeginEx::Proxy(ex) => Some(ex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub header: FrameHeader,
    pub affinity: u64,
    pub extension: BeginEx,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub header: FrameHeader,
    pub flags: u8,
    pub budget_id: u64,
    pub reserved: i32,
    pub payload: Option<Bytes>,
    pub extension: Option<KafkaDataEx>,
}

impl Data {
    pub fn length(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_init(&self) -> bool {
        self.flags & FLAG_INIT != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_skip(&self) -> bool {
        self.flags & FLAG_SKIP != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct End {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub header: FrameHeader,
    pub budget_id: u64,
    pub reserved: i32,
    pub extension: Option<KafkaFlushEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub header: FrameHeader,
    pub budget_id: u64,
    pub padding: i32,
    pub minimum: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reset {
    pub header: FrameHeader,
    pub extension: Option<KafkaResetEx>,
}

impl Reset {
    pub fn error(&self) -> i32 {
        self.extension.as_ref().map_or(0, |ex| ex.error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub header: FrameHeader,
    pub cancel_id: u64,
    pub signal_id: i32,
    pub context_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Begin(Begin),
    Data(Data),
    End(End),
    Abort(Abort),
    Flush(Flush),
    Window(Window),
    Reset(Reset),
    Signal(Signal),
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Begin(f) => &f.header,
            Frame::Data(f) => &f.header,
            Frame::End(f) => &f.header,
            Frame::Abort(f) => &f.header,
            Frame::Flush(f) => &f.header,
            Frame::Window(f) => &f.header,
            Frame::Reset(f) => &f.header,
            Frame::Signal(f) => &f.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut FrameHeader {
        match self {
            Frame::Begin(f) => &mut f.header,
            Frame::Data(f) => &mut f.header,
            Frame::End(f) => &mut f.header,
            Frame::Abort(f) => &mut f.header,
            Frame::Flush(f) => &mut f.header,
            Frame::Window(f) => &mut f.header,
            Frame::Reset(f) => &mut f.header,
            Frame::Signal(f) => &mut f.header,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    /// Whether the frame travels from initiator to acceptor of its half.
    pub fn is_forward(&self) -> bool {
        !matches!(self, Frame::Window(_) | Frame::Reset(_) | Frame::Signal(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "BEGIN",
            Frame::Data(_) => "DATA",
            Frame::End(_) => "END",
            Frame::Abort(_) => "ABORT",
            Frame::Flush(_) => "FLUSH",
            Frame::Window(_) => "WINDOW",
            Frame::Reset(_) => "RESET",
            Frame::Signal(_) => "SIGNAL",
        }
    }
}

/// Initial stream ids are odd, their reply ids are the even neighbour.
pub fn reply_id(initial_id: u64) -> u64 {
    initial_id ^ 1
}

pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_pairing() {
        assert!(is_initial(5));
        assert_eq!(reply_id(5), 4);
        assert_eq!(reply_id(4), 5);
        assert!(!is_initial(reply_id(5)));
    }

    #[test]
    fn test_frame_direction() {
        let header = FrameHeader::new(1, 2, 3);
        let data = Frame::Data(Data {
            header,
            flags: FLAGS_COMPLETE,
            budget_id: 0,
            reserved: 0,
            payload: None,
            extension: None,
        });
        let window = Frame::Window(Window {
            header,
            budget_id: 0,
            padding: 0,
            minimum: 0,
        });
        assert!(data.is_forward());
        assert!(!window.is_forward());
        assert_eq!(window.name(), "WINDOW");
    }
}
