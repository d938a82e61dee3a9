pub mod exif;
pub mod jpeg;
pub mod null;
pub mod segment;
pub mod tables;
pub mod thumbnail;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::capture::frame::FrameDescriptor;
use crate::error::Result;
use crate::{EncoderConfig, ThumbnailConfig};

pub use exif::{DeviceIdentity, ExifBlock, MetadataBlock};
pub use null::NullEncoder;
pub use segment::OutputSegment;

/// Turns one raw frame into the bytes of its output segment.
///
/// Implementations are shared by every worker, so they hold no per-frame
/// state.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Jpeg,
    /// Raw planes passed through untouched
    Yuv420,
}

/// Build the encoder selected by `config.codec`.
pub fn create(config: &EncoderConfig) -> Arc<dyn FrameEncoder> {
    match config.codec {
        Codec::Jpeg => Arc::new(JpegEncoder::new(config)),
        Codec::Yuv420 => Arc::new(NullEncoder),
    }
}

/// Compressor + metadata embedder + splice
pub struct JpegEncoder {
    quality: u8,
    thumbnail: Option<ThumbnailConfig>,
    identity: DeviceIdentity,
}

impl JpegEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            quality: config.quality,
            thumbnail: (config.thumbnail.quality > 0).then(|| config.thumbnail.clone()),
            identity: DeviceIdentity::from(config),
        }
    }
}

impl FrameEncoder for JpegEncoder {
    #[instrument(level = "debug", skip_all, fields(seq = frame.sequence_index))]
    fn encode(&self, frame: &FrameDescriptor) -> Result<Bytes> {
        let planes = frame.planes()?;
        let jpeg = jpeg::compress(&planes, self.quality)?;

        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let request = self
            .thumbnail
            .as_ref()
            .map(|config| exif::ThumbnailRequest {
                image: &planes,
                config,
            });
        let metadata = exif::embed(&frame.metadata, &self.identity, now, request)?;

        segment::assemble(&metadata, &jpeg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Geometry;
    use crate::capture::info::CaptureMetadata;

    fn frame(width: u32, height: u32) -> FrameDescriptor {
        let geometry = Geometry::yuv420(width, height);
        FrameDescriptor {
            data: Bytes::from(vec![128u8; geometry.buffer_len()]),
            geometry,
            metadata: CaptureMetadata::default(),
            timestamp_us: 0,
            sequence_index: 0,
        }
    }

    #[test]
    fn jpeg_codec_produces_app1_segment() {
        let encoder = create(&EncoderConfig::default());
        let out = encoder.encode(&frame(32, 32)).unwrap();
        assert_eq!(&out[..4], &segment::SEGMENT_MARKER);
        assert_eq!(&out[out.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn yuv420_codec_passes_planes_through() {
        let config = EncoderConfig {
            codec: Codec::Yuv420,
            ..Default::default()
        };
        let input = frame(8, 8);
        let out = create(&config).encode(&input).unwrap();
        assert_eq!(out, input.data);
    }

    #[test]
    fn bad_geometry_is_a_compression_failure() {
        let mut input = frame(16, 16);
        input.data = input.data.slice(..10);
        let result = create(&EncoderConfig::default()).encode(&input);
        assert!(matches!(
            result,
            Err(crate::error::EncodeError::CompressionFailure(_))
        ));
    }
}
