//! Concurrent encode pipeline
//!
//! Submission queue -> worker pool -> per-worker lanes -> reassembly -> sink.

pub mod queue;
pub mod reorder;
pub mod stats;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::capture::frame::RawFrame;
use crate::capture::BufferRelease;
use crate::encoder::{self, FrameEncoder};
use crate::error::{EncodeError, Result};
use crate::output::Sink;
use crate::EncoderConfig;

pub use queue::SubmissionQueue;
pub use stats::PipelineReport;

use reorder::Reassembler;
use stats::Stats;
use worker::Worker;

/// State every pipeline thread holds a handle to.
pub(crate) struct Shared {
    pub queue: SubmissionQueue,
    pub stats: Stats,
    aborted: AtomicBool,
    failure: Mutex<Option<EncodeError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            queue: SubmissionQueue::new(),
            stats: Stats::default(),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Abort the whole pipeline. Only the first failure is kept.
    pub fn fail(&self, err: EncodeError) {
        error!("Pipeline failed: {}", err);
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.aborted.store(true, Ordering::Release);
        self.queue.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn take_failure(&self) -> Option<EncodeError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A running encode pipeline.
///
/// Frames go in through [`Pipeline::submit`] from any thread and come out of
/// the sink on the reassembly thread, one call per frame, in submission order.
/// Any encode or sink failure aborts the whole pipeline; the error is returned
/// by [`Pipeline::shutdown`].
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    reassembler: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start `config.workers` encode threads around `encoder` plus the
    /// reassembly thread feeding `sink`. `release`, if given, receives every
    /// raw buffer back once nothing reads it any more.
    pub fn new(
        config: &EncoderConfig,
        encoder: Arc<dyn FrameEncoder>,
        sink: Box<dyn Sink>,
        release: Option<Arc<dyn BufferRelease>>,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(EncodeError::InvalidConfig("workers must be at least 1".into()));
        }

        let shared = Arc::new(Shared::new());
        let mut pipeline = Self {
            shared: Arc::clone(&shared),
            workers: Vec::with_capacity(config.workers),
            reassembler: None,
        };

        let cores = if config.pin_workers {
            let cores = core_affinity::get_core_ids().unwrap_or_default();
            if cores.is_empty() {
                warn!("Core ids unavailable, workers will not be pinned");
            }
            cores
        } else {
            Vec::new()
        };

        let mut lanes = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (tx, rx) = flume::unbounded();
            lanes.push(rx);

            let worker = Worker {
                id,
                shared: Arc::clone(&shared),
                encoder: Arc::clone(&encoder),
                release: release.clone(),
                output: tx,
                core: (!cores.is_empty()).then(|| cores[id % cores.len()]),
                verbose: config.verbose,
            };
            // On error the partially built pipeline is dropped, which closes
            // the queue and joins whatever already started
            let handle = worker.spawn().map_err(spawn_error)?;
            pipeline.workers.push(handle);
        }

        let reassembler = Reassembler::new(lanes, shared, sink, config.verbose);
        pipeline.reassembler = Some(reassembler.spawn().map_err(spawn_error)?);

        info!(
            "Encode pipeline started: {} workers, codec {:?}, quality {}",
            config.workers, config.codec, config.quality
        );
        Ok(pipeline)
    }

    /// Pipeline using the encoder selected by `config.codec`.
    pub fn from_config(config: &EncoderConfig, sink: Box<dyn Sink>) -> Result<Self> {
        Self::new(config, encoder::create(config), sink, None)
    }

    /// Queue a frame and return its sequence index.
    ///
    /// Fails with `QueueClosed` once shutdown has begun or the pipeline has
    /// aborted.
    pub fn submit(&self, frame: RawFrame) -> Result<u64> {
        let index = self.shared.queue.submit(frame)?;
        self.shared.stats.record_submitted();
        Ok(index)
    }

    /// Stop accepting frames. Frames already queued are still encoded and
    /// delivered; [`Pipeline::shutdown`] waits for them.
    pub fn close(&self) {
        self.shared.queue.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// Counters so far.
    pub fn report(&self) -> PipelineReport {
        self.shared.stats.snapshot()
    }

    /// Two-phase drain: stop accepting frames and let the workers finish
    /// everything already queued, then let reassembly emit every segment.
    /// Returns the first failure if the pipeline aborted.
    pub fn shutdown(mut self) -> Result<PipelineReport> {
        self.join();
        match self.shared.take_failure() {
            Some(err) => Err(err),
            None => {
                let report = self.report();
                info!(
                    "Encode pipeline stopped: {} submitted, {} delivered",
                    report.submitted, report.delivered
                );
                Ok(report)
            }
        }
    }

    fn join(&mut self) {
        self.shared.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.shared
                    .fail(EncodeError::Worker("encode thread panicked".into()));
            }
        }

        if let Some(handle) = self.reassembler.take() {
            if handle.join().is_err() {
                self.shared
                    .fail(EncodeError::Worker("reassembly thread panicked".into()));
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.join();
    }
}

fn spawn_error(err: std::io::Error) -> EncodeError {
    EncodeError::Worker(format!("cannot spawn thread: {err}"))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::{FrameDescriptor, Geometry};
    use crate::capture::info::CaptureMetadata;

    /// Echoes the sequence index, sleeping longer for even frames so workers
    /// finish out of order.
    struct Echo;

    impl FrameEncoder for Echo {
        fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes> {
            if frame.sequence_index % 2 == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Bytes::copy_from_slice(&frame.sequence_index.to_le_bytes()))
        }
    }

    struct FailAt(u64);

    impl FrameEncoder for FailAt {
        fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes> {
            if frame.sequence_index == self.0 {
                return Err(EncodeError::compression("injected"));
            }
            Ok(Bytes::new())
        }
    }

    fn raw(ts: i64) -> RawFrame {
        RawFrame::new(
            Bytes::from_static(&[0; 6]),
            Geometry::yuv420(2, 2),
            CaptureMetadata::default(),
            ts,
        )
    }

    fn config(workers: usize) -> EncoderConfig {
        EncoderConfig {
            workers,
            ..Default::default()
        }
    }

    fn collecting_sink() -> (Box<dyn Sink>, Arc<Mutex<Vec<(u64, i64)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let sink = move |data: &[u8], ts: i64, _final: bool| -> io::Result<()> {
            let index = u64::from_le_bytes(data.try_into().unwrap());
            out.lock().unwrap().push((index, ts));
            Ok(())
        };
        (Box::new(sink), seen)
    }

    #[test]
    fn delivers_in_submission_order() {
        let (sink, seen) = collecting_sink();
        let pipeline = Pipeline::new(&config(3), Arc::new(Echo), sink, None).unwrap();
        for i in 0..20 {
            assert_eq!(pipeline.submit(raw(i * 10)).unwrap(), i as u64);
        }
        let report = pipeline.shutdown().unwrap();

        let seen = seen.lock().unwrap();
        let expected: Vec<(u64, i64)> = (0..20).map(|i| (i as u64, i * 10)).collect();
        assert_eq!(*seen, expected);
        assert_eq!(report.submitted, 20);
        assert_eq!(report.delivered, 20);
    }

    #[test]
    fn empty_pipeline_shuts_down_cleanly() {
        let (sink, seen) = collecting_sink();
        let pipeline = Pipeline::new(&config(2), Arc::new(Echo), sink, None).unwrap();
        let report = pipeline.shutdown().unwrap();
        assert_eq!(report, PipelineReport::default());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn encode_failure_aborts_and_is_reported() {
        let sink = Box::new(|_: &[u8], _: i64, _: bool| -> io::Result<()> { Ok(()) });
        let pipeline = Pipeline::new(&config(2), Arc::new(FailAt(3)), sink, None).unwrap();
        for i in 0..10 {
            let _ = pipeline.submit(raw(i));
        }
        assert!(matches!(
            pipeline.shutdown(),
            Err(EncodeError::CompressionFailure(_))
        ));
    }

    #[test]
    fn panicking_encoder_is_a_worker_error() {
        struct Boom;
        impl FrameEncoder for Boom {
            fn encode(&self, _: &FrameDescriptor) -> Result<Bytes> {
                panic!("boom");
            }
        }

        let (sink, _) = collecting_sink();
        let pipeline = Pipeline::new(&config(1), Arc::new(Boom), sink, None).unwrap();
        pipeline.submit(raw(0)).unwrap();
        match pipeline.shutdown() {
            Err(EncodeError::Worker(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn every_buffer_is_released_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let release: Arc<dyn BufferRelease> = Arc::new(move |_: u64, _: Bytes| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let (sink, _) = collecting_sink();
        let pipeline = Pipeline::new(&config(4), Arc::new(Echo), sink, Some(release)).unwrap();
        for i in 0..12 {
            pipeline.submit(raw(i)).unwrap();
        }
        let report = pipeline.shutdown().unwrap();
        assert_eq!(released.load(Ordering::Relaxed), 12);
        assert_eq!(report.released, 12);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let (sink, _) = collecting_sink();
        assert!(matches!(
            Pipeline::new(&config(0), Arc::new(Echo), sink, None),
            Err(EncodeError::InvalidConfig(_))
        ));
    }
}
