//! Submission queue: numbers frames and feeds the worker pool

use std::sync::{Mutex, PoisonError};

use flume::{Receiver, Sender};

use crate::capture::frame::{FrameDescriptor, RawFrame};
use crate::error::{EncodeError, Result};

struct Inner {
    tx: Option<Sender<FrameDescriptor>>,
    next_index: u64,
}

/// Shared FIFO of numbered frames.
///
/// Numbering and enqueueing happen under one lock, so queue order is index
/// order. Closing drops the only sender: workers drain what is left and then
/// observe the disconnect, which doubles as the shutdown wake-up.
pub struct SubmissionQueue {
    inner: Mutex<Inner>,
    rx: Receiver<FrameDescriptor>,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Mutex::new(Inner {
                tx: Some(tx),
                next_index: 0,
            }),
            rx,
        }
    }

    /// Assign the next sequence index to `frame` and queue it.
    pub fn submit(&self, frame: RawFrame) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let index = inner.next_index;
        let tx = inner.tx.as_ref().ok_or(EncodeError::QueueClosed)?;
        tx.send(FrameDescriptor::from_raw(frame, index))
            .map_err(|_| EncodeError::QueueClosed)?;
        inner.next_index += 1;
        Ok(index)
    }

    /// Stop accepting frames. Already queued frames stay available.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tx
            .is_none()
    }

    /// Number of indices handed out so far.
    pub fn submitted(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_index
    }

    /// Block until a frame is available. `None` once the queue is closed and
    /// empty.
    pub fn next(&self) -> Option<FrameDescriptor> {
        self.rx.recv().ok()
    }

    /// Take whatever is still queued without waiting.
    pub fn drain(&self) -> Vec<FrameDescriptor> {
        self.rx.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::Geometry;
    use crate::capture::info::CaptureMetadata;

    fn raw(ts: i64) -> RawFrame {
        RawFrame::new(
            Bytes::from_static(&[0; 6]),
            Geometry::yuv420(2, 2),
            CaptureMetadata::default(),
            ts,
        )
    }

    #[test]
    fn indices_are_contiguous_and_fifo() {
        let queue = SubmissionQueue::new();
        for i in 0..5 {
            assert_eq!(queue.submit(raw(i)).unwrap(), i as u64);
        }
        queue.close();

        let seen: Vec<u64> = std::iter::from_fn(|| queue.next())
            .map(|f| f.sequence_index)
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn closed_queue_rejects_but_drains() {
        let queue = SubmissionQueue::new();
        queue.submit(raw(0)).unwrap();
        queue.close();

        assert!(matches!(queue.submit(raw(1)), Err(EncodeError::QueueClosed)));
        assert_eq!(queue.submitted(), 1);
        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }

    #[test]
    fn concurrent_submitters_never_share_an_index() {
        let queue = Arc::new(SubmissionQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..250)
                        .map(|i| queue.submit(raw(i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());

        queue.close();
        let order: Vec<u64> = std::iter::from_fn(|| queue.next())
            .map(|f| f.sequence_index)
            .collect();
        assert_eq!(order, (0..1000).collect::<Vec<_>>());
    }
}
