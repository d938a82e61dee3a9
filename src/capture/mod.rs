pub mod frame;
pub mod info;
pub mod pattern;

use bytes::Bytes;

pub use frame::{ChromaLayout, FrameDescriptor, Geometry, PlanarImage, RawFrame};
pub use info::{CaptureMetadata, FrameInfo};
pub use pattern::TestPattern;

/// Callback through which the pipeline hands a raw buffer back to its capture
/// source once every byte of it has been read.
pub trait BufferRelease: Send + Sync {
    fn release(&self, sequence_index: u64, buffer: Bytes);
}

impl<F> BufferRelease for F
where
    F: Fn(u64, Bytes) + Send + Sync,
{
    fn release(&self, sequence_index: u64, buffer: Bytes) {
        self(sequence_index, buffer)
    }
}
