//! One gateway connection multiplexing many client streams.

use dashmap::DashMap;
use fluxgate::frame::{Begin, BeginEx, Frame, FrameCodec, FrameHeader, KafkaBeginEx};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::FluxgateClientError;
use crate::stream::ClientStream;

type Routes = Arc<DashMap<u64, mpsc::UnboundedSender<Frame>>>;

/// Connection to a gateway listener
#[derive(Debug)]
pub struct Connection {
    pub gateway: String,
    config: ClientConfig,
    writer: mpsc::UnboundedSender<Frame>,
    streams: Routes,
    next_stream_id: AtomicU64,
    _handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>, FluxgateClientError> {
        config.validate()?;
        let gateway = config.gateway.clone();
        debug!("Connecting to gateway: {}", gateway);

        let stream = timeout(config.connection_timeout, TcpStream::connect(&gateway))
            .await
            .map_err(|_| FluxgateClientError::timeout(config.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                FluxgateClientError::connection(format!("Failed to connect to {}: {}", gateway, e))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY towards {}: {}", gateway, e);
        }

        let (writer, outbound) = mpsc::unbounded_channel();
        let streams: Routes = Arc::new(DashMap::new());
        let handle = tokio::spawn(Self::connection_loop(
            gateway.clone(),
            Framed::new(stream, FrameCodec),
            outbound,
            Arc::clone(&streams),
        ));
        info!("Connected to gateway: {}", gateway);

        Ok(Arc::new(Self {
            gateway,
            config,
            writer,
            streams,
            next_stream_id: AtomicU64::new(1),
            _handle: handle,
        }))
    }

    /// Begins a new stream routed to `routed_id`.
    pub fn open(
        self: &Arc<Self>,
        routed_id: u64,
        affinity: u64,
        extension: KafkaBeginEx,
    ) -> Result<ClientStream, FluxgateClientError> {
        let initial_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, frames) = mpsc::unbounded_channel();
        self.streams.insert(initial_id, tx);

        let begin = Frame::Begin(Begin {
            header: FrameHeader::new(0, routed_id, initial_id),
            affinity,
            extension: BeginEx::Kafka(extension),
        });
        if let Err(e) = self.send(begin) {
            self.streams.remove(&initial_id);
            return Err(e);
        }
        Ok(ClientStream::new(
            Arc::clone(self),
            initial_id,
            routed_id,
            frames,
            &self.config,
        ))
    }

    pub fn send(&self, frame: Frame) -> Result<(), FluxgateClientError> {
        self.writer
            .send(frame)
            .map_err(|_| FluxgateClientError::connection("Connection closed"))
    }

    pub(crate) fn forget(&self, initial_id: u64) {
        self.streams.remove(&initial_id);
    }

    /// Check if connection is healthy
    pub fn is_healthy(&self) -> bool {
        !self.writer.is_closed()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    async fn connection_loop(
        gateway: String,
        framed: Framed<TcpStream, FrameCodec>,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        streams: Routes,
    ) {
        let (mut sink, mut source) = framed.split::<Frame>();
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        trace!("-> {} stream {}", frame.name(), frame.stream_id());
                        if let Err(e) = sink.send(frame).await {
                            warn!("Failed to write to {}: {}", gateway, e);
                            break;
                        }
                    }
                    None => break,
                },
                frame = source.next() => match frame {
                    Some(Ok(frame)) => {
                        let initial_id = frame.stream_id() | 1;
                        let delivered = streams
                            .get(&initial_id)
                            .map(|stream| stream.send(frame).is_ok())
                            .unwrap_or(false);
                        if !delivered {
                            trace!("Dropping frame for unknown stream {}", initial_id);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Error reading from {}: {}", gateway, e);
                        break;
                    }
                    None => {
                        debug!("Gateway {} closed the connection", gateway);
                        break;
                    }
                },
            }
        }
        // dropping the senders wakes every stream with a closed error
        streams.clear();
        info!("Connection to {} closed", gateway);
    }
}
