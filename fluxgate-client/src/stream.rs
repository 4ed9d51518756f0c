//! Client half of one gateway stream with its credit windows.

use bytes::Bytes;
use fluxgate::flow::{Reservation, StreamWindow};
use fluxgate::frame::{
    is_initial, reply_id, Data, End, Frame, FrameHeader, KafkaDataEx, Window, FLAG_FIN, FLAG_INIT,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::FluxgateClientError;

pub struct ClientStream {
    connection: Arc<Connection>,
    initial_id: u64,
    routed_id: u64,
    frames: mpsc::UnboundedReceiver<Frame>,
    deferred: VecDeque<Frame>,
    initial: StreamWindow,
    reply: StreamWindow,
    reply_window: i32,
    request_timeout: Duration,
    reply_opened: bool,
    initial_closed: bool,
    reply_closed: bool,
}

impl ClientStream {
    pub(crate) fn new(
        connection: Arc<Connection>,
        initial_id: u64,
        routed_id: u64,
        frames: mpsc::UnboundedReceiver<Frame>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            connection,
            initial_id,
            routed_id,
            frames,
            deferred: VecDeque::new(),
            initial: StreamWindow::new(),
            reply: StreamWindow::new(),
            reply_window: config.reply_window,
            request_timeout: config.request_timeout,
            reply_opened: false,
            initial_closed: false,
            reply_closed: false,
        }
    }

    pub fn initial_id(&self) -> u64 {
        self.initial_id
    }

    /// Credit the gateway has granted on the initial stream.
    pub fn budget(&self) -> i32 {
        self.initial.budget()
    }

    /// Whether everything written so far has been acknowledged.
    pub fn acknowledged(&self) -> bool {
        self.initial.pending() == 0
    }

    /// Next frame from the gateway.
    ///
    /// Windows and reply Begin/Data are accounted before being returned. A
    /// Reset surfaces as [`FluxgateClientError::Rejected`] and an Abort of the
    /// reply as [`FluxgateClientError::Closed`].
    pub async fn recv(&mut self) -> Result<Frame, FluxgateClientError> {
        match self.deferred.pop_front() {
            Some(frame) => Ok(frame),
            None => self.recv_frame().await,
        }
    }

    async fn recv_frame(&mut self) -> Result<Frame, FluxgateClientError> {
        let frame = match timeout(self.request_timeout, self.frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(FluxgateClientError::closed("connection closed")),
            Err(_) => {
                return Err(FluxgateClientError::timeout(
                    self.request_timeout.as_millis() as u64,
                ))
            }
        };
        trace!("<- {} stream {}", frame.name(), frame.stream_id());

        let on_reply = !is_initial(frame.stream_id());
        match &frame {
            Frame::Window(window) if !on_reply => {
                self.initial.apply_window(
                    window.header.acknowledge,
                    window.header.maximum,
                    window.padding,
                    window.minimum,
                    window.budget_id,
                )?;
            }
            Frame::Reset(reset) if !on_reply => {
                self.initial_closed = true;
                return Err(FluxgateClientError::rejected(reset.error()));
            }
            Frame::Begin(_) if on_reply => {
                self.reply_opened = true;
                self.do_reply_window(false)?;
            }
            Frame::Data(data) if on_reply => {
                self.reply.on_data(data.header.sequence, data.reserved)?;
                self.do_reply_window(true)?;
            }
            Frame::End(_) if on_reply => {
                self.reply_closed = true;
            }
            Frame::Abort(_) if on_reply => {
                self.reply_closed = true;
                return Err(FluxgateClientError::closed("reply aborted"));
            }
            _ => {}
        }
        Ok(frame)
    }

    /// Waits until the reply stream has begun.
    pub async fn opened(&mut self) -> Result<(), FluxgateClientError> {
        while !self.reply_opened {
            if self.reply_closed {
                return Err(FluxgateClientError::closed("reply ended before it began"));
            }
            self.recv().await?;
        }
        Ok(())
    }

    /// Writes a message split over as many Data frames as the window needs.
    pub async fn write(
        &mut self,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    ) -> Result<(), FluxgateClientError> {
        let mut remaining = payload.unwrap_or_default();
        let has_payload = !remaining.is_empty();
        let mut extension = extension;
        let mut flags = FLAG_INIT;
        loop {
            let (reserved, length) = self.reserve(remaining.len()).await?;
            let chunk = remaining.split_to(length);
            if remaining.is_empty() {
                flags |= FLAG_FIN;
            }
            self.send_data(
                flags,
                reserved,
                has_payload.then_some(chunk),
                extension.take(),
            )?;
            if flags & FLAG_FIN != 0 {
                return Ok(());
            }
            flags = 0;
        }
    }

    /// Writes a payload-less message charging at least `reserved` credit.
    pub async fn write_control(
        &mut self,
        reserved: i32,
        extension: KafkaDataEx,
    ) -> Result<(), FluxgateClientError> {
        let reserved = reserved.max(self.initial.padding).max(self.initial.minimum);
        while self.initial.budget() < reserved {
            self.recv_during_write().await?;
        }
        self.send_data(FLAG_INIT | FLAG_FIN, reserved, None, Some(extension))
    }

    /// Waits until everything written has been acknowledged.
    pub async fn flushed(&mut self) -> Result<(), FluxgateClientError> {
        while !self.acknowledged() {
            self.recv_during_write().await?;
        }
        Ok(())
    }

    async fn reserve(&mut self, length: usize) -> Result<(i32, usize), FluxgateClientError> {
        loop {
            if self.initial.maximum > 0 {
                if let Reservation::Send { reserved, length } = self.initial.reserve(length) {
                    return Ok((reserved, length));
                }
            }
            self.recv_during_write().await?;
        }
    }

    /// Receives while blocked on credit, keeping anything but windows for
    /// the next [`ClientStream::recv`].
    async fn recv_during_write(&mut self) -> Result<(), FluxgateClientError> {
        match self.recv_frame().await? {
            Frame::Window(_) => Ok(()),
            Frame::End(_) => Err(FluxgateClientError::closed("stream ended while writing")),
            other => {
                debug!("stream {} deferring {}", self.initial_id, other.name());
                self.deferred.push_back(other);
                Ok(())
            }
        }
    }

    fn send_data(
        &mut self,
        flags: u8,
        reserved: i32,
        payload: Option<Bytes>,
        extension: Option<KafkaDataEx>,
    ) -> Result<(), FluxgateClientError> {
        let frame = Frame::Data(Data {
            header: self.initial_header(),
            flags,
            budget_id: 0,
            reserved,
            payload,
            extension,
        });
        self.initial.sent(reserved);
        self.connection.send(frame)
    }

    fn do_reply_window(&mut self, opened: bool) -> Result<(), FluxgateClientError> {
        if self.reply.compute_credit(0, self.reply_window, opened).is_some() {
            self.connection.send(Frame::Window(Window {
                header: self.reply_header(),
                budget_id: 0,
                padding: 0,
                minimum: 0,
            }))?;
        }
        Ok(())
    }

    /// Ends the initial stream; the reply keeps flowing until the gateway ends it.
    pub fn end(&mut self) -> Result<(), FluxgateClientError> {
        if self.initial_closed {
            return Ok(());
        }
        self.initial_closed = true;
        self.connection.send(Frame::End(End {
            header: self.initial_header(),
        }))
    }

    fn initial_header(&self) -> FrameHeader {
        FrameHeader::new(0, self.routed_id, self.initial_id).window(
            self.initial.sequence,
            self.initial.acknowledge,
            self.initial.maximum,
        )
    }

    fn reply_header(&self) -> FrameHeader {
        FrameHeader::new(0, self.routed_id, reply_id(self.initial_id)).window(
            self.reply.sequence,
            self.reply.acknowledge,
            self.reply.maximum,
        )
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        let _ = self.end();
        self.connection.forget(self.initial_id);
    }
}
