//! Order reassembly: fan-in of the worker lanes back into submission order

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvError, Selector, TryRecvError};
use tracing::{debug, info};

use crate::encoder::OutputSegment;
use crate::error::EncodeError;
use crate::output::Sink;
use crate::pipeline::Shared;

/// Upper bound on how long the reassembly thread sleeps before re-checking
/// for an abort.
pub const WAIT: Duration = Duration::from_millis(200);

/// One worker's output queue plus the segment at its front.
struct Lane {
    rx: Receiver<OutputSegment>,
    head: Option<OutputSegment>,
    /// Worker has exited; nothing more will arrive
    done: bool,
}

pub(crate) struct Reassembler {
    lanes: Vec<Lane>,
    next_expected: u64,
    shared: Arc<Shared>,
    sink: Box<dyn Sink>,
    verbose: bool,
}

impl Reassembler {
    pub fn new(
        lanes: Vec<Receiver<OutputSegment>>,
        shared: Arc<Shared>,
        sink: Box<dyn Sink>,
        verbose: bool,
    ) -> Self {
        Self {
            lanes: lanes
                .into_iter()
                .map(|rx| Lane {
                    rx,
                    head: None,
                    done: false,
                })
                .collect(),
            next_expected: 0,
            shared,
            sink,
            verbose,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reassembly".into())
            .spawn(move || self.run())
    }

    /// Emit segments until every lane is finished and empty, or the pipeline
    /// aborts.
    ///
    /// Each worker takes frames from a FIFO and finishes them one at a time,
    /// so every lane is already sorted by index. The next frame to emit is
    /// therefore always at the front of some lane.
    fn run(mut self) {
        loop {
            if self.shared.is_aborted() {
                debug!("Reassembly aborting at frame {}", self.next_expected);
                break;
            }

            self.refill();

            if let Some(segment) = self.take_next() {
                if let Err(err) = self.emit(segment) {
                    self.shared.fail(EncodeError::SinkWriteFailure(err));
                    break;
                }
                continue;
            }

            if self.is_drained() {
                break;
            }

            if !self.wait() {
                // Every live lane holds a later frame and no lane can supply
                // the missing one
                self.shared.fail(EncodeError::Worker(format!(
                    "frame {} never arrived",
                    self.next_expected
                )));
                break;
            }
        }

        info!("Reassembly finished after {} frames", self.next_expected);
    }

    fn refill(&mut self) {
        for lane in self.lanes.iter_mut().filter(|l| l.head.is_none() && !l.done) {
            match lane.rx.try_recv() {
                Ok(segment) => lane.head = Some(segment),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => lane.done = true,
            }
        }
    }

    fn take_next(&mut self) -> Option<OutputSegment> {
        let next = self.next_expected;
        self.lanes
            .iter_mut()
            .find(|l| matches!(&l.head, Some(s) if s.sequence_index == next))
            .and_then(|l| l.head.take())
    }

    fn is_drained(&self) -> bool {
        self.lanes.iter().all(|l| l.done && l.head.is_none())
    }

    /// Sleep until an empty lane produces something or `WAIT` passes.
    /// Returns false when there is no lane left to wait on.
    fn wait(&mut self) -> bool {
        let mut selector = Selector::new();
        let mut waiting = false;
        for (i, lane) in self.lanes.iter().enumerate() {
            if lane.head.is_none() && !lane.done {
                selector = selector.recv(&lane.rx, move |r| (i, r));
                waiting = true;
            }
        }
        if !waiting {
            return false;
        }

        match selector.wait_timeout(WAIT) {
            Ok((i, Ok(segment))) => self.lanes[i].head = Some(segment),
            Ok((i, Err(RecvError::Disconnected))) => self.lanes[i].done = true,
            Err(_) => {}
        }
        true
    }

    fn emit(&mut self, segment: OutputSegment) -> io::Result<()> {
        let OutputSegment {
            data,
            timestamp_us,
            sequence_index,
        } = segment;

        self.sink.deliver(&data, timestamp_us, true)?;
        self.shared.stats.record_delivered();
        if self.verbose {
            info!(seq = sequence_index, "Delivered {} bytes", data.len());
        } else {
            debug!(seq = sequence_index, "Delivered {} bytes", data.len());
        }

        self.next_expected += 1;
        Ok(())
    }
}
