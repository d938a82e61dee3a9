//! Output segment assembly
//!
//! ```text
//! [FF D8 FF E1][len: u16 BE = exif + thumb + 2][exif][thumb][jpeg[HEADER_LEN..]]
//! ```
//!
//! The compressor's own SOI + JFIF header is dropped and replaced by SOI +
//! APP1 carrying the metadata, giving one contiguous JPEG without a second
//! compression pass.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::exif::{MetadataBlock, MAX_SEGMENT_LEN};
use crate::encoder::jpeg::HEADER_LEN;
use crate::error::{EncodeError, Result};

/// SOI followed by the APP1 marker.
pub const SEGMENT_MARKER: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE1];

/// One finished frame on its way to the sink.
#[derive(Debug, Clone)]
pub struct OutputSegment {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub sequence_index: u64,
}

impl OutputSegment {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Splice `metadata` in front of the entropy-coded part of `jpeg`.
pub fn assemble(metadata: &MetadataBlock, jpeg: &[u8]) -> Result<Bytes> {
    let payload = metadata.payload_len() + 2;
    if payload > MAX_SEGMENT_LEN {
        return Err(EncodeError::metadata(format!(
            "APP1 payload of {payload} bytes does not fit a segment"
        )));
    }
    let body = jpeg
        .get(HEADER_LEN..)
        .ok_or_else(|| EncodeError::compression("compressed stream shorter than its header"))?;

    let mut out = BytesMut::with_capacity(SEGMENT_MARKER.len() + payload + body.len());
    out.put_slice(&SEGMENT_MARKER);
    out.put_u16(payload as u16);
    out.put_slice(&metadata.exif);
    if let Some(thumb) = &metadata.thumbnail {
        out.put_slice(thumb);
    }
    out.put_slice(body);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_layout() {
        let metadata = MetadataBlock {
            exif: vec![1, 2, 3],
            thumbnail: Some(vec![4, 5]),
            thumbnail_quality: Some(50),
        };
        let mut jpeg = vec![0xAA; HEADER_LEN];
        jpeg.extend_from_slice(&[0xFF, 0xDB, 9, 9]);

        let out = assemble(&metadata, &jpeg).unwrap();
        assert_eq!(
            &out[..],
            &[0xFF, 0xD8, 0xFF, 0xE1, 0, 7, 1, 2, 3, 4, 5, 0xFF, 0xDB, 9, 9]
        );
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let metadata = MetadataBlock {
            exif: vec![0; 8],
            thumbnail: None,
            thumbnail_quality: None,
        };
        assert!(matches!(
            assemble(&metadata, &[0xFF, 0xD8]),
            Err(EncodeError::CompressionFailure(_))
        ));
    }
}
