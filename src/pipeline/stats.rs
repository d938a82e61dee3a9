//! Pipeline-wide counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;

/// Counters bumped from the submission path, the workers and the reassembly
/// thread. Each lives on its own cache line since each has a different writer.
#[derive(Default)]
pub struct Stats {
    submitted: CachePadded<AtomicU64>,
    encoded: CachePadded<AtomicU64>,
    delivered: CachePadded<AtomicU64>,
    released: CachePadded<AtomicU64>,
    encoded_bytes: CachePadded<AtomicU64>,
    encode_nanos: CachePadded<AtomicU64>,
}

impl Stats {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stillpipe_frames_submitted").increment(1);
    }

    pub fn record_encoded(&self, bytes: usize, elapsed: Duration) {
        self.encoded.fetch_add(1, Ordering::Relaxed);
        self.encoded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.encode_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        metrics::counter!("stillpipe_frames_encoded").increment(1);
        metrics::histogram!("stillpipe_encode_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stillpipe_frames_delivered").increment(1);
    }

    pub fn snapshot(&self) -> PipelineReport {
        let encoded = self.encoded.load(Ordering::Relaxed);
        let nanos = self.encode_nanos.load(Ordering::Relaxed);
        PipelineReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            encoded,
            delivered: self.delivered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            encoded_bytes: self.encoded_bytes.load(Ordering::Relaxed),
            average_encode: Duration::from_nanos(nanos.checked_div(encoded).unwrap_or(0)),
        }
    }
}

/// Totals for one pipeline instance, returned by shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub submitted: u64,
    pub encoded: u64,
    pub delivered: u64,
    /// Raw buffers handed back to the capture source
    pub released: u64,
    pub encoded_bytes: u64,
    pub average_encode: Duration,
}
