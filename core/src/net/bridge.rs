//! Bridges one network stream of the engine onto a broker TCP socket.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::worker::WorkerEvent;
use crate::flow::{Reservation, StreamWindow};
use crate::frame::{
    reply_id, Abort, Begin, BeginEx, Data, End, Frame, FrameHeader, ProxyBeginEx, Reset, Window,
    FLAGS_COMPLETE,
};
use crate::Result;

const READ_CHUNK: usize = 8 * 1024;

pub struct TcpBridge {
    header: FrameHeader,
    address: ProxyBeginEx,
    window: i32,
    events: mpsc::UnboundedSender<WorkerEvent>,
    frames: mpsc::UnboundedReceiver<Frame>,
    initial: StreamWindow,
    reply: StreamWindow,
    reply_opened: bool,
    initial_closed: bool,
    reply_closed: bool,
}

impl TcpBridge {
    /// Connects to `address` on a new task and returns the sender for the
    /// frames the engine writes on the stream begun with `header`.
    pub fn spawn(
        header: FrameHeader,
        address: ProxyBeginEx,
        window: i32,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> mpsc::UnboundedSender<Frame> {
        let (tx, frames) = mpsc::unbounded_channel();
        let bridge = TcpBridge {
            header,
            address,
            window,
            events,
            frames,
            initial: StreamWindow::new(),
            reply: StreamWindow::new(),
            reply_opened: false,
            initial_closed: false,
            reply_closed: false,
        };
        tokio::spawn(bridge.run());
        tx
    }

    async fn run(mut self) {
        let initial_id = self.header.stream_id;
        let address = self.address.address();
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                debug!("stream {} connected to {}", initial_id, address);
                if let Err(e) = self.serve(stream).await {
                    warn!("stream {} to {} failed: {}", initial_id, address, e);
                }
                self.abort();
            }
            Err(e) => {
                warn!("connect to {} failed: {}", address, e);
                self.abort();
            }
        }
        let _ = self.events.send(WorkerEvent::BridgeClosed(initial_id));
    }

    async fn serve(&mut self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        self.reply_opened = true;
        self.emit(Frame::Begin(Begin {
            header: self.reply_header(),
            affinity: 0,
            extension: BeginEx::None,
        }));
        self.do_initial_window(false);

        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        let mut eof = false;

        while !(self.initial_closed && self.reply_closed) {
            let readable = !eof && buffer.is_empty() && self.reply.budget() > self.reply.padding;
            if readable {
                buffer.reserve(READ_CHUNK);
            }

            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Some(Frame::Data(data)) => {
                        self.initial
                            .on_data(data.header.sequence, data.reserved)?;
                        if let Some(payload) = &data.payload {
                            writer.write_all(payload).await?;
                        }
                        self.do_initial_window(true);
                    }
                    Some(Frame::End(_)) => {
                        self.initial_closed = true;
                        writer.shutdown().await?;
                    }
                    Some(Frame::Abort(_)) => {
                        self.initial_closed = true;
                        return Ok(());
                    }
                    Some(Frame::Window(window)) => {
                        let header = window.header;
                        self.reply.apply_window(
                            header.acknowledge,
                            header.maximum,
                            window.padding,
                            window.minimum,
                            window.budget_id,
                        )?;
                    }
                    Some(Frame::Reset(_)) => {
                        self.reply_closed = true;
                        return Ok(());
                    }
                    Some(other) => trace!("bridge ignoring {}", other.name()),
                    None => return Ok(()),
                },
                read = reader.read_buf(&mut buffer), if readable => {
                    if read? == 0 {
                        eof = true;
                    }
                }
            }

            self.do_reply_data(&mut buffer);
            if eof && buffer.is_empty() && !self.reply_closed {
                self.reply_closed = true;
                self.emit(Frame::End(End {
                    header: self.reply_header(),
                }));
            }
        }
        Ok(())
    }

    fn do_reply_data(&mut self, buffer: &mut BytesMut) {
        while !buffer.is_empty() && !self.reply_closed {
            match self.reply.reserve(buffer.len()) {
                Reservation::Send { reserved, length } => {
                    let payload = buffer.split_to(length).freeze();
                    self.emit(Frame::Data(Data {
                        header: self.reply_header(),
                        flags: FLAGS_COMPLETE,
                        budget_id: self.reply.budget_id,
                        reserved,
                        payload: Some(payload),
                        extension: None,
                    }));
                    self.reply.sent(reserved);
                }
                Reservation::Defer => break,
            }
        }
    }

    fn do_initial_window(&mut self, opened: bool) {
        if self.initial_closed {
            return;
        }
        if self.initial.compute_credit(0, self.window, opened).is_some() {
            self.emit(Frame::Window(Window {
                header: self.initial_header(),
                budget_id: 0,
                padding: 0,
                minimum: 0,
            }));
        }
    }

    /// Closes whatever halves are still open.
    fn abort(&mut self) {
        if !self.initial_closed {
            self.initial_closed = true;
            self.emit(Frame::Reset(Reset {
                header: self.initial_header(),
                extension: None,
            }));
        }
        if self.reply_opened && !self.reply_closed {
            self.reply_closed = true;
            self.emit(Frame::Abort(Abort {
                header: self.reply_header(),
            }));
        }
    }

    fn emit(&self, frame: Frame) {
        if self.events.send(WorkerEvent::Network(frame)).is_err() {
            trace!("worker gone, dropping frame for {}", self.header.stream_id);
        }
    }

    fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(self.header.origin_id, self.header.routed_id, self.header.stream_id)
            .window(
                self.initial.sequence,
                self.initial.acknowledge,
                self.initial.maximum,
            )
    }

    fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(
            self.header.origin_id,
            self.header.routed_id,
            reply_id(self.header.stream_id),
        )
        .window(self.reply.sequence, self.reply.acknowledge, self.reply.maximum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Frame {
        loop {
            match rx.recv().await {
                Some(WorkerEvent::Network(frame)) => return frame,
                Some(_) => continue,
                None => panic!("bridge events closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_bridge_relays_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(b"pong").await.unwrap();
            request
        });

        let (events, mut rx) = mpsc::unbounded_channel();
        let header = FrameHeader::new(3, 4, 11);
        let frames = TcpBridge::spawn(header, ProxyBeginEx::new("127.0.0.1", port), 1024, events);

        assert!(matches!(next_frame(&mut rx).await, Frame::Begin(b) if b.header.stream_id == 10));
        assert!(
            matches!(next_frame(&mut rx).await, Frame::Window(w) if w.header.maximum == 1024)
        );

        frames
            .send(Frame::Window(Window {
                header: FrameHeader::new(3, 4, 10).window(0, 0, 512),
                budget_id: 0,
                padding: 0,
                minimum: 0,
            }))
            .unwrap();
        frames
            .send(Frame::Data(Data {
                header: FrameHeader::new(3, 4, 11).window(0, 0, 1024),
                flags: FLAGS_COMPLETE,
                budget_id: 0,
                reserved: 4,
                payload: Some(bytes::Bytes::from_static(b"ping")),
                extension: None,
            }))
            .unwrap();

        assert_eq!(&broker.await.unwrap(), b"ping");

        let mut received = Vec::new();
        while received.len() < 4 {
            match next_frame(&mut rx).await {
                Frame::Data(data) => {
                    assert_eq!(data.header.stream_id, 10);
                    received.extend_from_slice(data.payload.as_deref().unwrap_or_default());
                }
                Frame::Window(window) => assert_eq!(window.header.stream_id, 11),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, b"pong");
    }

    #[tokio::test]
    async fn test_connect_failure_resets_initial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (events, mut rx) = mpsc::unbounded_channel();
        let _frames = TcpBridge::spawn(
            FrameHeader::new(3, 4, 21),
            ProxyBeginEx::new("127.0.0.1", port),
            1024,
            events,
        );

        assert!(matches!(next_frame(&mut rx).await, Frame::Reset(r) if r.header.stream_id == 21));
        assert!(matches!(rx.recv().await, Some(WorkerEvent::BridgeClosed(21))));
    }
}
