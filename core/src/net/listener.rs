//! Accepts application connections speaking the frame protocol.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::worker::WorkerEvent;
use crate::frame::{Frame, FrameCodec};
use crate::{FluxgateError, Result};

pub struct ApplicationListener {
    listener: TcpListener,
    workers: Arc<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    next_connection: u64,
}

impl ApplicationListener {
    pub fn new(listener: TcpListener, workers: Arc<Vec<mpsc::UnboundedSender<WorkerEvent>>>) -> Self {
        Self {
            listener,
            workers,
            next_connection: 1,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` fires, spreading them over the
    /// workers round robin.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.workers.is_empty() {
            return Err(FluxgateError::Config("no workers to serve connections".to_string()));
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let connection = self.next_connection;
                        self.next_connection += 1;
                        let worker = self.workers[(connection as usize) % self.workers.len()].clone();
                        info!("Application {} connected as {}", peer_addr, connection);
                        tokio::spawn(async move {
                            match handle_connection(stream, connection, worker).await {
                                Ok(()) => debug!("Application {} disconnected", peer_addr),
                                Err(e) => warn!("Application {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept application connection: {}", e),
                },
                _ = shutdown.recv() => {
                    info!("Application listener shutting down...");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection: u64,
    worker: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on connection {}: {}", connection, e);
    }
    let (mut sink, mut source) = Framed::new(stream, FrameCodec).split::<Frame>();

    let (frames, mut outbound) = mpsc::unbounded_channel();
    worker
        .send(WorkerEvent::Attached { connection, frames })
        .map_err(|_| FluxgateError::Network("worker stopped".to_string()))?;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!("Write to connection {} failed: {}", connection, e);
                break;
            }
        }
    });

    let result = loop {
        match source.next().await {
            Some(Ok(frame)) => {
                if worker
                    .send(WorkerEvent::Application { connection, frame })
                    .is_err()
                {
                    break Ok(());
                }
            }
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        }
    };

    let _ = worker.send(WorkerEvent::Detached { connection });
    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, Window};

    #[tokio::test]
    async fn test_connection_frames_reach_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let application = ApplicationListener::new(listener, Arc::new(vec![tx]));
        let addr = application.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accepting = tokio::spawn(application.run(shutdown_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec);
        let window = Frame::Window(Window {
            header: FrameHeader::new(0, 2, 1).window(0, 0, 1024),
            budget_id: 0,
            padding: 0,
            minimum: 0,
        });
        framed.send(window.clone()).await.unwrap();

        let frames = match rx.recv().await {
            Some(WorkerEvent::Attached { connection, frames }) => {
                assert_eq!(connection, 1);
                frames
            }
            other => panic!("unexpected {:?}", other),
        };
        match rx.recv().await {
            Some(WorkerEvent::Application { connection, frame }) => {
                assert_eq!(connection, 1);
                assert_eq!(frame, window);
            }
            other => panic!("unexpected {:?}", other),
        }

        frames.send(window.clone()).unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), window);

        drop(framed);
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Detached { connection: 1 })));

        shutdown_tx.send(()).unwrap();
        accepting.await.unwrap().unwrap();
    }
}
