//! Encode workers

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use core_affinity::CoreId;
use flume::Sender;
use tracing::{debug, info, warn};

use crate::capture::frame::FrameDescriptor;
use crate::capture::BufferRelease;
use crate::encoder::{FrameEncoder, OutputSegment};
use crate::error::EncodeError;
use crate::pipeline::Shared;

/// One member of the pool. Pulls from the shared submission queue and pushes
/// finished segments, in the order it finished them, onto its own lane.
pub(crate) struct Worker {
    pub id: usize,
    pub shared: Arc<Shared>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub release: Option<Arc<dyn BufferRelease>>,
    pub output: Sender<OutputSegment>,
    pub core: Option<CoreId>,
    pub verbose: bool,
}

impl Worker {
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("encode-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) {
        if let Some(core) = self.core {
            if !core_affinity::set_for_current(core) {
                warn!("Worker {} could not be pinned to core {}", self.id, core.id);
            }
        }

        let mut frames = 0u32;
        let mut busy = Duration::ZERO;

        while let Some(frame) = self.shared.queue.next() {
            if self.shared.is_aborted() {
                self.release(frame.sequence_index, frame.data);
                continue;
            }

            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.encoder.encode(&frame)))
                .unwrap_or_else(|payload| Err(EncodeError::Worker(panic_message(&*payload))));
            let elapsed = started.elapsed();

            let FrameDescriptor {
                data,
                timestamp_us,
                sequence_index,
                ..
            } = frame;
            // Nothing reads the raw planes past this point
            self.release(sequence_index, data);

            let encoded = match result {
                Ok(encoded) => encoded,
                Err(err) => {
                    self.shared.fail(err);
                    continue;
                }
            };

            frames += 1;
            busy += elapsed;
            self.shared.stats.record_encoded(encoded.len(), elapsed);
            if self.verbose {
                info!(
                    worker = self.id,
                    seq = sequence_index,
                    "Encoded {} bytes in {:?}",
                    encoded.len(),
                    elapsed
                );
            } else {
                debug!(
                    worker = self.id,
                    seq = sequence_index,
                    "Encoded {} bytes in {:?}",
                    encoded.len(),
                    elapsed
                );
            }

            let segment = OutputSegment {
                data: encoded,
                timestamp_us,
                sequence_index,
            };
            if self.output.send(segment).is_err() {
                // Reassembly only stops early on abort; keep draining so the
                // remaining buffers still get released
                debug!("Worker {} dropping frame {}", self.id, sequence_index);
            }
        }

        let average = busy.checked_div(frames).unwrap_or_default();
        if self.verbose {
            info!("Worker {}: encoded {} frames, average time {:?}", self.id, frames, average);
        } else {
            debug!("Worker {}: encoded {} frames, average time {:?}", self.id, frames, average);
        }
    }

    fn release(&self, sequence_index: u64, data: Bytes) {
        if let Some(release) = &self.release {
            release.release(sequence_index, data);
        }
        self.shared.stats.record_released();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "encoder panicked".into())
}
