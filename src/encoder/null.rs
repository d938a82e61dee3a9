use bytes::Bytes;

use crate::capture::frame::FrameDescriptor;
use crate::encoder::FrameEncoder;
use crate::error::Result;

/// Pass-through "codec": the segment is a copy of the raw 4:2:0 planes.
///
/// The bytes are copied rather than shared so the raw buffer can go back to
/// the capture source as soon as encoding returns.
pub struct NullEncoder;

impl FrameEncoder for NullEncoder {
    fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes> {
        frame.planes()?;
        Ok(Bytes::copy_from_slice(
            &frame.data[..frame.geometry.buffer_len()],
        ))
    }
}
