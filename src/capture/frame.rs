use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::info::CaptureMetadata;
use crate::error::{EncodeError, Result};

/// Chroma layouts we accept. Only 4:2:0 planar is produced by the camera path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChromaLayout {
    #[default]
    Yuv420,
}

/// Geometry of one planar buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// Luma row stride in bytes; chroma rows use half of it.
    pub stride: u32,
    pub layout: ChromaLayout,
}

impl Geometry {
    /// Tightly packed 4:2:0 geometry (stride rounded up to an even width).
    pub fn yuv420(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width + (width & 1),
            layout: ChromaLayout::Yuv420,
        }
    }

    pub fn chroma_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    pub fn chroma_height(&self) -> u32 {
        self.height.div_ceil(2)
    }

    pub fn chroma_stride(&self) -> u32 {
        self.stride / 2
    }

    fn luma_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        self.chroma_stride() as usize * self.chroma_height() as usize
    }

    /// Minimum number of bytes a buffer with this geometry must hold.
    pub fn buffer_len(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::compression(format!(
                "empty image {}x{}",
                self.width, self.height
            )));
        }
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(EncodeError::compression(format!(
                "image {}x{} exceeds 65535 pixels per side",
                self.width, self.height
            )));
        }
        if self.stride < self.width || self.chroma_stride() < self.chroma_width() {
            return Err(EncodeError::compression(format!(
                "stride {} too small for width {}",
                self.stride, self.width
            )));
        }
        Ok(())
    }

    /// Borrow the three planes of `data` laid out according to this geometry.
    pub fn planes<'a>(&self, data: &'a [u8]) -> Result<PlanarImage<'a>> {
        self.validate()?;
        if data.len() < self.buffer_len() {
            return Err(EncodeError::compression(format!(
                "buffer holds {} bytes, geometry {}x{} stride {} needs {}",
                data.len(),
                self.width,
                self.height,
                self.stride,
                self.buffer_len()
            )));
        }

        let (y, rest) = data.split_at(self.luma_len());
        let (u, rest) = rest.split_at(self.chroma_len());
        let v = &rest[..self.chroma_len()];

        Ok(PlanarImage {
            width: self.width,
            height: self.height,
            y,
            u,
            v,
            y_stride: self.stride as usize,
            c_stride: self.chroma_stride() as usize,
        })
    }
}

/// Borrowed view over the luma and chroma planes of a 4:2:0 image.
#[derive(Debug, Clone, Copy)]
pub struct PlanarImage<'a> {
    pub width: u32,
    pub height: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub c_stride: usize,
}

impl<'a> PlanarImage<'a> {
    pub fn chroma_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    pub fn chroma_height(&self) -> u32 {
        self.height.div_ceil(2)
    }

    /// Luma row `row`, clamped to the last valid row.
    pub fn luma_row(&self, row: u32) -> &'a [u8] {
        let row = row.min(self.height - 1) as usize;
        let start = row * self.y_stride;
        &self.y[start..start + self.width as usize]
    }

    /// Cb and Cr rows `row`, clamped to the last valid chroma row.
    pub fn chroma_rows(&self, row: u32) -> (&'a [u8], &'a [u8]) {
        let row = row.min(self.chroma_height() - 1) as usize;
        let start = row * self.c_stride;
        let end = start + self.chroma_width() as usize;
        (&self.u[start..end], &self.v[start..end])
    }
}

/// A raw frame as handed over by the capture source, before it is numbered.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Planar pixel data. Owned by the capture source; the pipeline hands the
    /// handle back through [`BufferRelease`](crate::capture::BufferRelease).
    pub data: Bytes,
    pub geometry: Geometry,
    pub metadata: CaptureMetadata,
    /// Capture time, monotonic microseconds
    pub timestamp_us: i64,
}

impl RawFrame {
    pub fn new(data: Bytes, geometry: Geometry, metadata: CaptureMetadata, timestamp_us: i64) -> Self {
        Self {
            data,
            geometry,
            metadata,
            timestamp_us,
        }
    }
}

/// One raw buffer awaiting encoding, numbered by the submission queue.
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    pub data: Bytes,
    pub geometry: Geometry,
    pub metadata: CaptureMetadata,
    pub timestamp_us: i64,
    pub sequence_index: u64,
}

impl FrameDescriptor {
    pub(crate) fn from_raw(frame: RawFrame, sequence_index: u64) -> Self {
        Self {
            data: frame.data,
            geometry: frame.geometry,
            metadata: frame.metadata,
            timestamp_us: frame.timestamp_us,
            sequence_index,
        }
    }

    pub fn planes(&self) -> Result<PlanarImage<'_>> {
        self.geometry.planes(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_geometry_sizes() {
        let geometry = Geometry::yuv420(33, 17);
        assert_eq!(geometry.stride, 34);
        assert_eq!(geometry.chroma_width(), 17);
        assert_eq!(geometry.chroma_height(), 9);
        assert_eq!(geometry.buffer_len(), 34 * 17 + 2 * 17 * 9);
    }

    #[test]
    fn rows_clamp_to_last_valid_row() {
        let geometry = Geometry::yuv420(4, 3);
        let mut data = vec![0u8; geometry.buffer_len()];
        for (row, chunk) in data[..12].chunks_mut(4).enumerate() {
            chunk.fill(row as u8 + 1);
        }
        let planes = geometry.planes(&data).unwrap();

        assert_eq!(planes.luma_row(2), &[3, 3, 3, 3]);
        assert_eq!(planes.luma_row(15), &[3, 3, 3, 3]);
        let (u, v) = planes.chroma_rows(7);
        assert_eq!(u.len(), 2);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let geometry = Geometry::yuv420(16, 16);
        let data = vec![0u8; geometry.buffer_len() - 1];
        assert!(matches!(
            geometry.planes(&data),
            Err(EncodeError::CompressionFailure(_))
        ));
    }

    #[test]
    fn narrow_stride_is_rejected() {
        let geometry = Geometry {
            width: 20,
            height: 8,
            stride: 16,
            layout: ChromaLayout::Yuv420,
        };
        assert!(geometry.validate().is_err());
    }
}
