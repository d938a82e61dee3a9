use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stillpipe::capture::{BufferRelease, CaptureMetadata, FrameDescriptor, Geometry, RawFrame};
use stillpipe::encoder::FrameEncoder;
use stillpipe::output::Sink;
use stillpipe::{EncodeError, EncoderConfig, Pipeline, Result};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn raw(timestamp_us: i64) -> RawFrame {
    let geometry = Geometry::yuv420(4, 4);
    RawFrame::new(
        Bytes::from(vec![0u8; geometry.buffer_len()]),
        geometry,
        CaptureMetadata::default(),
        timestamp_us,
    )
}

fn config(workers: usize) -> EncoderConfig {
    EncoderConfig {
        workers,
        ..Default::default()
    }
}

/// Sleeps a per-frame delay and emits the frame's index as its payload.
struct Delayed {
    delays: Vec<Duration>,
}

impl FrameEncoder for Delayed {
    fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes> {
        let delay = self.delays[frame.sequence_index as usize % self.delays.len()];
        thread::sleep(delay);
        Ok(Bytes::copy_from_slice(&frame.sequence_index.to_le_bytes()))
    }
}

type Deliveries = Arc<Mutex<Vec<(u64, i64)>>>;

fn recording_sink() -> (Box<dyn Sink>, Deliveries) {
    let seen: Deliveries = Arc::default();
    let out = Arc::clone(&seen);
    let sink = move |data: &[u8], ts: i64, is_final: bool| -> io::Result<()> {
        assert!(is_final);
        let index = u64::from_le_bytes(data.try_into().expect("8-byte payload"));
        out.lock().unwrap().push((index, ts));
        Ok(())
    };
    (Box::new(sink), seen)
}

#[test]
fn hundred_frames_arrive_in_order_and_in_parallel() {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(7);
    let delays: Vec<Duration> = (0..100)
        .map(|_| Duration::from_millis(rng.gen_range(1..=12)))
        .collect();
    let total: Duration = delays.iter().sum();

    let (sink, seen) = recording_sink();
    let encoder = Arc::new(Delayed { delays });
    let pipeline = Pipeline::new(&config(4), encoder, sink, None).unwrap();

    let started = Instant::now();
    for i in 0..100 {
        assert_eq!(pipeline.submit(raw(i * 33_333)).unwrap(), i as u64);
    }
    let report = pipeline.shutdown().unwrap();
    let wall = started.elapsed();

    let seen = seen.lock().unwrap();
    let expected: Vec<(u64, i64)> = (0..100).map(|i| (i as u64, i * 33_333)).collect();
    assert_eq!(*seen, expected);
    assert_eq!(report.delivered, 100);
    assert!(
        wall < total,
        "wall time {wall:?} not below serial time {total:?}"
    );
}

#[test]
fn shutdown_drains_queued_frames_and_refuses_new_ones() {
    init_tracing();
    let (sink, seen) = recording_sink();
    let encoder = Arc::new(Delayed {
        delays: vec![Duration::from_millis(15)],
    });
    let pipeline = Pipeline::new(&config(2), encoder, sink, None).unwrap();

    const QUEUED: u64 = 12;
    for i in 0..QUEUED {
        pipeline.submit(raw(i as i64)).unwrap();
    }
    pipeline.close();
    assert!(matches!(
        pipeline.submit(raw(99)),
        Err(EncodeError::QueueClosed)
    ));

    let report = pipeline.shutdown().unwrap();
    let indices: Vec<u64> = seen.lock().unwrap().iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, (0..QUEUED).collect::<Vec<_>>());
    assert_eq!(report.submitted, QUEUED);
    assert_eq!(report.delivered, QUEUED);
}

#[test]
fn sink_failure_is_fatal() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sink = move |_: &[u8], _: i64, _: bool| -> io::Result<()> {
        if counter.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        }
        Ok(())
    };

    let encoder = Arc::new(Delayed {
        delays: vec![Duration::ZERO],
    });
    let pipeline = Pipeline::new(&config(3), encoder, Box::new(sink), None).unwrap();
    for i in 0..20 {
        if pipeline.submit(raw(i)).is_err() {
            break;
        }
    }

    match pipeline.shutdown() {
        Err(EncodeError::SinkWriteFailure(err)) => assert_eq!(err.kind(), io::ErrorKind::StorageFull),
        other => panic!("expected sink failure, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn malformed_frame_aborts_without_gaps() {
    init_tracing();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let sink = move |_: &[u8], _: i64, _: bool| -> io::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let pipeline = Pipeline::from_config(&config(2), Box::new(sink)).unwrap();

    pipeline.submit(raw(0)).unwrap();
    let broken = RawFrame::new(
        Bytes::from_static(&[0; 3]),
        Geometry::yuv420(64, 64),
        CaptureMetadata::default(),
        1,
    );
    pipeline.submit(broken).unwrap();
    for i in 2..10 {
        let _ = pipeline.submit(raw(i));
    }

    assert!(matches!(
        pipeline.shutdown(),
        Err(EncodeError::CompressionFailure(_))
    ));
    // Frame 1 never encoded, so nothing after frame 0 may reach the sink
    assert!(delivered.load(Ordering::SeqCst) <= 1);
}

#[test]
fn buffers_are_released_after_encoding() {
    init_tracing();
    let released = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&released);
    let release: Arc<dyn BufferRelease> = Arc::new(move |index: u64, buffer: Bytes| {
        assert_eq!(buffer.len(), Geometry::yuv420(4, 4).buffer_len());
        log.lock().unwrap().push(index);
    });

    let (sink, _) = recording_sink();
    let encoder = Arc::new(Delayed {
        delays: vec![Duration::from_millis(1)],
    });
    let pipeline = Pipeline::new(&config(4), encoder, sink, Some(release)).unwrap();
    for i in 0..30 {
        pipeline.submit(raw(i)).unwrap();
    }
    pipeline.shutdown().unwrap();

    let mut released = released.lock().unwrap().clone();
    released.sort_unstable();
    assert_eq!(released, (0..30).collect::<Vec<_>>());
}
