//! Worker task owning one shard's [`Engine`].
//!
//! Application connections share the engine, so each worker maps the stream
//! ids an application chose onto ids of its own before frames enter the
//! engine, and maps them back on the way out. Network streams the engine
//! opens towards brokers are served by a [`TcpBridge`] each.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::bridge::TcpBridge;
use crate::engine::Engine;
use crate::flow::BudgetWatcher;
use crate::frame::{is_initial, reply_id, Abort, Frame, FrameHeader, KafkaResetEx, Reset};

const TICK: Duration = Duration::from_millis(10);

/// Everything a worker reacts to besides its timer tick.
#[derive(Debug)]
pub enum WorkerEvent {
    /// An application connection was accepted; frames for it go to `frames`.
    Attached {
        connection: u64,
        frames: mpsc::UnboundedSender<Frame>,
    },
    Application {
        connection: u64,
        frame: Frame,
    },
    Detached {
        connection: u64,
    },
    /// A frame read from a broker socket.
    Network(Frame),
    /// The bridge serving this initial stream id has exited.
    BridgeClosed(u64),
    /// A budget watched by a stream of this shard was credited elsewhere.
    Wake(BudgetWatcher),
}

#[derive(Debug)]
struct ApplicationStream {
    connection: u64,
    app_initial_id: u64,
    reply_opened: bool,
    initial_closed: bool,
    reply_closed: bool,
}

pub struct Worker {
    engine: Engine,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    peers: Arc<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    shutdown: broadcast::Receiver<()>,
    connections: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    stream_ids: HashMap<(u64, u64), u64>,
    streams: HashMap<u64, ApplicationStream>,
    bridges: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    next_stream_id: u64,
}

impl Worker {
    pub fn new(
        engine: Engine,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        peers: Arc<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            events,
            peers,
            shutdown,
            connections: HashMap::new(),
            stream_ids: HashMap::new(),
            streams: HashMap::new(),
            bridges: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub async fn run(mut self) {
        let shard = self.engine.shard();
        info!("Worker {} started", shard);
        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                _ = tick.tick() => {
                    self.engine.poll();
                }
                _ = self.shutdown.recv() => break,
            }
            self.flush();
        }

        let connections: Vec<u64> = self.connections.keys().copied().collect();
        for connection in connections {
            self.on_detached(connection);
        }
        self.flush();
        self.bridges.clear();
        let snapshot = self.engine.metrics().snapshot();
        info!(
            "Worker {} stopped (frames in={}, out={}, decode rejects={})",
            shard, snapshot.frames_in, snapshot.frames_out, snapshot.decode_rejects
        );
    }

    pub fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Attached { connection, frames } => {
                debug!("connection {} attached to worker {}", connection, self.engine.shard());
                self.connections.insert(connection, frames);
            }
            WorkerEvent::Application { connection, frame } => {
                self.on_application(connection, frame)
            }
            WorkerEvent::Detached { connection } => self.on_detached(connection),
            WorkerEvent::Network(frame) => self.engine.on_external(frame),
            WorkerEvent::BridgeClosed(initial_id) => {
                self.bridges.remove(&initial_id);
            }
            WorkerEvent::Wake(watcher) => self.engine.wake(watcher),
        }
    }

    /// Moves everything the engine wrote to its destination.
    pub fn flush(&mut self) {
        loop {
            let outbound = self.engine.drain_outbound();
            if outbound.is_empty() {
                break;
            }
            for frame in outbound {
                self.on_outbound(frame);
            }
        }

        for watcher in self.engine.drain_remote_wakeups() {
            match self.peers.get(watcher.shard) {
                Some(peer) => {
                    let _ = peer.send(WorkerEvent::Wake(watcher));
                }
                None => warn!("budget watcher for unknown shard {}", watcher.shard),
            }
        }
    }

    fn on_application(&mut self, connection: u64, mut frame: Frame) {
        let stream_id = frame.stream_id();
        let app_initial_id = stream_id | 1;
        let initial_id = match self.stream_ids.get(&(connection, app_initial_id)) {
            Some(initial_id) => *initial_id,
            None if matches!(frame, Frame::Begin(_)) && is_initial(stream_id) => {
                let initial_id = self.next_stream_id;
                self.next_stream_id += 2;
                self.stream_ids.insert((connection, app_initial_id), initial_id);
                self.streams.insert(
                    initial_id,
                    ApplicationStream {
                        connection,
                        app_initial_id,
                        reply_opened: false,
                        initial_closed: false,
                        reply_closed: false,
                    },
                );
                initial_id
            }
            None => {
                trace!(
                    "dropping {} for unknown stream {} of connection {}",
                    frame.name(),
                    stream_id,
                    connection
                );
                return;
            }
        };

        let engine_id = if is_initial(stream_id) {
            initial_id
        } else {
            reply_id(initial_id)
        };
        frame.header_mut().stream_id = engine_id;
        self.track(initial_id, &frame);
        self.engine.on_external(frame);
    }

    fn on_outbound(&mut self, mut frame: Frame) {
        let stream_id = frame.stream_id();
        let initial_id = stream_id | 1;

        if let Some(stream) = self.streams.get(&initial_id) {
            let connection = stream.connection;
            let app_id = if is_initial(stream_id) {
                stream.app_initial_id
            } else {
                reply_id(stream.app_initial_id)
            };
            self.track(initial_id, &frame);
            frame.header_mut().stream_id = app_id;
            if let Some(frames) = self.connections.get(&connection) {
                let _ = frames.send(frame);
            }
            return;
        }

        if let Some(bridge) = self.bridges.get(&initial_id) {
            if bridge.send(frame).is_err() {
                trace!("bridge for stream {} already gone", initial_id);
            }
            return;
        }

        match frame {
            Frame::Begin(begin) if is_initial(stream_id) => match begin.extension.proxy() {
                Some(address) => {
                    let Some(events) = self.peers.get(self.engine.shard()).cloned() else {
                        warn!("worker {} has no event channel", self.engine.shard());
                        return;
                    };
                    let window = self.engine.config().slot_capacity as i32;
                    let bridge = TcpBridge::spawn(begin.header, address.clone(), window, events);
                    self.bridges.insert(initial_id, bridge);
                }
                None => {
                    debug!("no binding for stream {}, resetting", stream_id);
                    let header = begin.header;
                    self.engine.on_external(Frame::Reset(Reset {
                        header: FrameHeader::new(header.origin_id, header.routed_id, stream_id),
                        extension: Some(KafkaResetEx::new(0)),
                    }));
                }
            },
            other => trace!("dropping {} for stream {}", other.name(), stream_id),
        }
    }

    fn on_detached(&mut self, connection: u64) {
        self.connections.remove(&connection);
        let initial_ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.connection == connection)
            .map(|(initial_id, _)| *initial_id)
            .collect();

        for initial_id in initial_ids {
            let Some(stream) = self.streams.remove(&initial_id) else {
                continue;
            };
            self.stream_ids.remove(&(connection, stream.app_initial_id));
            if !stream.initial_closed {
                self.engine.on_external(Frame::Abort(Abort {
                    header: FrameHeader::new(0, 0, initial_id),
                }));
            }
            if stream.reply_opened && !stream.reply_closed {
                self.engine.on_external(Frame::Reset(Reset {
                    header: FrameHeader::new(0, 0, reply_id(initial_id)),
                    extension: None,
                }));
            }
        }
        debug!("connection {} detached from worker {}", connection, self.engine.shard());
    }

    fn track(&mut self, initial_id: u64, frame: &Frame) {
        let Some(stream) = self.streams.get_mut(&initial_id) else {
            return;
        };
        let initial = is_initial(frame.stream_id());
        match frame {
            Frame::Begin(_) if !initial => stream.reply_opened = true,
            Frame::End(_) | Frame::Abort(_) | Frame::Reset(_) => {
                if initial {
                    stream.initial_closed = true;
                    // a reset before the reply began means the reply never will
                    if matches!(frame, Frame::Reset(_)) && !stream.reply_opened {
                        stream.reply_closed = true;
                    }
                } else {
                    stream.reply_closed = true;
                }
            }
            _ => {}
        }

        if stream.initial_closed && stream.reply_closed {
            let key = (stream.connection, stream.app_initial_id);
            self.stream_ids.remove(&key);
            self.streams.remove(&initial_id);
        }
    }
}
