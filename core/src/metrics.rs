//! # Gateway Metrics
//!
//! Lock-free counters updated from the engine hot path. Every update is a
//! single relaxed atomic increment; readers take a [`MetricsSnapshot`] and
//! never block writers.
//!
//! Shards share one [`GatewayMetrics`] through an `Arc`, so the counters are
//! process-wide totals.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};

/// Keeps hot counters of different shards on separate cache lines.
#[repr(align(64))]
#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    #[inline]
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    frames_in: Counter,
    frames_out: Counter,
    bytes_decoded: Counter,
    decode_rejects: Counter,
    reconnects_scheduled: Counter,
    slot_exhaustions: Counter,
    streams_opened: Counter,
    streams_refused: Counter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_in(&self) {
        self.frames_in.add(1);
    }

    pub fn record_frame_out(&self) {
        self.frames_out.add(1);
    }

    pub fn record_bytes_decoded(&self, bytes: usize) {
        self.bytes_decoded.add(bytes as u64);
    }

    pub fn record_decode_reject(&self) {
        self.decode_rejects.add(1);
    }

    pub fn record_reconnect(&self) {
        self.reconnects_scheduled.add(1);
    }

    pub fn record_slot_exhausted(&self) {
        self.slot_exhaustions.add(1);
    }

    pub fn record_stream_opened(&self) {
        self.streams_opened.add(1);
    }

    pub fn record_stream_refused(&self) {
        self.streams_refused.add(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: SystemTime::now(),
            frames_in: self.frames_in.get(),
            frames_out: self.frames_out.get(),
            bytes_decoded: self.bytes_decoded.get(),
            decode_rejects: self.decode_rejects.get(),
            reconnects_scheduled: self.reconnects_scheduled.get(),
            slot_exhaustions: self.slot_exhaustions.get(),
            streams_opened: self.streams_opened.get(),
            streams_refused: self.streams_refused.get(),
        }
    }

    pub fn report(&self) {
        let snapshot = self.snapshot();
        info!("=== FluxGate Metrics Report ===");
        info!(
            "Frames: in={}, out={}",
            snapshot.frames_in, snapshot.frames_out
        );
        info!(
            "Streams: opened={}, refused={}",
            snapshot.streams_opened, snapshot.streams_refused
        );
        info!(
            "Decoder: bytes={}, rejects={}",
            snapshot.bytes_decoded, snapshot.decode_rejects
        );
        info!(
            "Reconnects scheduled: {}, slot exhaustions: {}",
            snapshot.reconnects_scheduled, snapshot.slot_exhaustions
        );
        if let Ok(json) = snapshot.to_json() {
            debug!("metrics snapshot: {}", json);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: SystemTime,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_decoded: u64,
    pub decode_rejects: u64,
    pub reconnects_scheduled: u64,
    pub slot_exhaustions: u64,
    pub streams_opened: u64,
    pub streams_refused: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = GatewayMetrics::new();
        metrics.record_frame_in();
        metrics.record_frame_in();
        metrics.record_bytes_decoded(128);
        metrics.record_reconnect();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_in, 2);
        assert_eq!(snapshot.frames_out, 0);
        assert_eq!(snapshot.bytes_decoded, 128);
        assert_eq!(snapshot.reconnects_scheduled, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(GatewayMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_frame_out();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().frames_out, 4000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = GatewayMetrics::new().snapshot();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"frames_in\":0"));
    }
}
