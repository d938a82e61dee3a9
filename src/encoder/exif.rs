//! EXIF metadata block: tag directories, serialization and the thumbnail
//! quality ladder.
//!
//! The block is an `Exif\0\0` header followed by a little-endian TIFF
//! structure: IFD0 (device identity and date), the Exif sub-IFD (exposure and
//! ISO) and, when a thumbnail is embedded, IFD1 describing it. The thumbnail
//! bytes follow the block directly inside the APP1 segment, so its offset is
//! only known once the block has been laid out; the block is therefore
//! serialized once to measure it and again with the real offset and length.

use std::collections::BTreeMap;

use bytes::BufMut;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::capture::frame::PlanarImage;
use crate::capture::info::CaptureMetadata;
use crate::encoder::thumbnail::Thumbnail;
use crate::error::{EncodeError, Result};
use crate::{EncoderConfig, ThumbnailConfig};

pub const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

/// Largest value the APP1 length field can hold: block + thumbnail + 2.
pub const MAX_SEGMENT_LEN: usize = u16::MAX as usize;

pub const THUMBNAIL_QUALITY_STEP: u8 = 5;
pub const MAX_THUMBNAIL_ATTEMPTS: u32 = 20;

pub mod tag {
    pub const IMAGE_WIDTH: u16 = 0x0100;
    pub const IMAGE_LENGTH: u16 = 0x0101;
    pub const COMPRESSION: u16 = 0x0103;
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const SOFTWARE: u16 = 0x0131;
    pub const DATE_TIME: u16 = 0x0132;
    pub const JPEG_INTERCHANGE_FORMAT: u16 = 0x0201;
    pub const JPEG_INTERCHANGE_FORMAT_LENGTH: u16 = 0x0202;
    pub const EXPOSURE_TIME: u16 = 0x829A;
    pub const EXIF_IFD_POINTER: u16 = 0x8769;
    pub const ISO_SPEED_RATINGS: u16 = 0x8827;
}

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

/// JPEG compression, as recorded for an embedded thumbnail.
const COMPRESSION_JPEG: u16 = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Ascii(String),
    Short(u16),
    Long(u32),
    Rational(u32, u32),
}

impl Value {
    fn kind(&self) -> u16 {
        match self {
            Value::Ascii(_) => TYPE_ASCII,
            Value::Short(_) => TYPE_SHORT,
            Value::Long(_) => TYPE_LONG,
            Value::Rational(..) => TYPE_RATIONAL,
        }
    }

    fn count(&self) -> u32 {
        match self {
            Value::Ascii(s) => s.len() as u32 + 1,
            _ => 1,
        }
    }

    /// Bytes stored outside the 4-byte entry slot, padded to a word boundary.
    fn external_len(&self) -> usize {
        let len = match self {
            Value::Ascii(s) if s.len() + 1 > 4 => s.len() + 1,
            Value::Rational(..) => 8,
            _ => 0,
        };
        len + (len & 1)
    }

    fn write_data(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Ascii(s) => {
                buf.put_slice(s.as_bytes());
                buf.put_u8(0);
            }
            Value::Short(v) => buf.put_u16_le(*v),
            Value::Long(v) => buf.put_u32_le(*v),
            Value::Rational(num, den) => {
                buf.put_u32_le(*num);
                buf.put_u32_le(*den);
            }
        }
    }
}

/// One image file directory. Entries are kept sorted by tag, as TIFF requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directory {
    entries: BTreeMap<u16, Value>,
}

impl Directory {
    pub fn set(&mut self, tag: u16, value: Value) {
        self.entries.insert(tag, value);
    }

    pub fn get(&self, tag: u16) -> Option<&Value> {
        self.entries.get(&tag)
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn table_len(&self) -> usize {
        2 + 12 * self.entries.len() + 4
    }

    fn encoded_len(&self) -> usize {
        self.table_len() + self.entries.values().map(Value::external_len).sum::<usize>()
    }

    /// Append this directory, located at TIFF offset `at`, to `buf`.
    fn write(&self, buf: &mut Vec<u8>, at: usize, next: u32) {
        let mut data_at = at + self.table_len();
        let mut data = Vec::new();

        buf.put_u16_le(self.entries.len() as u16);
        for (&tag, value) in &self.entries {
            buf.put_u16_le(tag);
            buf.put_u16_le(value.kind());
            buf.put_u32_le(value.count());

            let external = value.external_len();
            if external > 0 {
                buf.put_u32_le(data_at as u32);
                let start = data.len();
                value.write_data(&mut data);
                data.resize(start + external, 0);
                data_at += external;
            } else {
                let start = buf.len();
                value.write_data(buf);
                buf.resize(start + 4, 0);
            }
        }
        buf.put_u32_le(next);
        buf.put_slice(&data);
    }

    fn read(tiff: &[u8], at: usize) -> Option<(Self, u32)> {
        let count = read_u16(tiff, at)? as usize;
        let mut dir = Directory::default();
        for i in 0..count {
            let entry = at + 2 + 12 * i;
            let tag = read_u16(tiff, entry)?;
            let kind = read_u16(tiff, entry + 2)?;
            let n = read_u32(tiff, entry + 4)? as usize;
            let slot = entry + 8;
            let value = match kind {
                TYPE_ASCII => {
                    let start = if n <= 4 {
                        slot
                    } else {
                        read_u32(tiff, slot)? as usize
                    };
                    let raw = tiff.get(start..start + n)?;
                    let text = raw.split(|&b| b == 0).next().unwrap_or_default();
                    Value::Ascii(String::from_utf8_lossy(text).into_owned())
                }
                TYPE_SHORT => Value::Short(read_u16(tiff, slot)?),
                TYPE_LONG => Value::Long(read_u32(tiff, slot)?),
                TYPE_RATIONAL => {
                    let off = read_u32(tiff, slot)? as usize;
                    Value::Rational(read_u32(tiff, off)?, read_u32(tiff, off + 4)?)
                }
                _ => continue,
            };
            dir.set(tag, value);
        }
        let next = read_u32(tiff, at + 2 + 12 * count)?;
        Some((dir, next))
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

/// The full tag set of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifBlock {
    pub ifd0: Directory,
    pub exif: Directory,
    pub ifd1: Option<Directory>,
}

impl ExifBlock {
    /// Serialize to `Exif\0\0` + little-endian TIFF.
    pub fn serialize(&self) -> Vec<u8> {
        let mut ifd0 = self.ifd0.clone();
        let has_exif = !self.exif.is_empty();
        if has_exif {
            // reserve the slot first so IFD0 has its final size
            ifd0.set(tag::EXIF_IFD_POINTER, Value::Long(0));
        }

        let ifd0_at = 8;
        let exif_at = ifd0_at + ifd0.encoded_len();
        let ifd1_at = exif_at + if has_exif { self.exif.encoded_len() } else { 0 };
        if has_exif {
            ifd0.set(tag::EXIF_IFD_POINTER, Value::Long(exif_at as u32));
        }

        let mut out = Vec::with_capacity(
            EXIF_HEADER.len() + ifd1_at + self.ifd1.as_ref().map_or(0, Directory::encoded_len),
        );
        out.put_slice(EXIF_HEADER);

        let mut tiff = Vec::new();
        tiff.put_slice(b"II");
        tiff.put_u16_le(42);
        tiff.put_u32_le(ifd0_at as u32);

        let next = if self.ifd1.is_some() { ifd1_at as u32 } else { 0 };
        ifd0.write(&mut tiff, ifd0_at, next);
        if has_exif {
            self.exif.write(&mut tiff, exif_at, 0);
        }
        if let Some(ifd1) = &self.ifd1 {
            ifd1.write(&mut tiff, ifd1_at, 0);
        }

        out.put_slice(&tiff);
        out
    }

    /// Read back a block produced by [`ExifBlock::serialize`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        let tiff = data.strip_prefix(EXIF_HEADER.as_slice())?;
        if tiff.get(..4)? != b"II\x2a\x00" {
            return None;
        }

        let (mut ifd0, next) = Directory::read(tiff, read_u32(tiff, 4)? as usize)?;
        let exif = match ifd0.entries.remove(&tag::EXIF_IFD_POINTER) {
            Some(Value::Long(at)) => Directory::read(tiff, at as usize)?.0,
            _ => Directory::default(),
        };
        let ifd1 = match next {
            0 => None,
            at => Some(Directory::read(tiff, at as usize)?.0),
        };

        Some(Self { ifd0, exif, ifd1 })
    }
}

/// Who made the picture, as written into IFD0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub make: String,
    pub model: String,
    pub software: String,
}

impl From<&EncoderConfig> for DeviceIdentity {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            make: config.make.clone(),
            model: config.model.clone(),
            software: config.software.clone(),
        }
    }
}

/// Source image and settings for an embedded thumbnail.
pub struct ThumbnailRequest<'a> {
    pub image: &'a PlanarImage<'a>,
    pub config: &'a ThumbnailConfig,
}

/// Serialized metadata plus the thumbnail that must follow it.
#[derive(Debug, Clone)]
pub struct MetadataBlock {
    pub exif: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
    /// Quality the thumbnail was finally compressed at
    pub thumbnail_quality: Option<u8>,
}

impl MetadataBlock {
    /// Bytes of metadata and thumbnail together.
    pub fn payload_len(&self) -> usize {
        self.exif.len() + self.thumbnail.as_ref().map_or(0, Vec::len)
    }
}

/// Tags derived from the capture metadata. Absent metadata yields no tag.
pub fn build_tags(
    metadata: &CaptureMetadata,
    identity: &DeviceIdentity,
    now: OffsetDateTime,
) -> Result<ExifBlock> {
    let date = now
        .format(format_description!(
            "[year]:[month]:[day] [hour]:[minute]:[second]"
        ))
        .map_err(|e| EncodeError::metadata(format!("cannot format capture date: {e}")))?;

    let mut block = ExifBlock::default();
    block.ifd0.set(tag::MAKE, Value::Ascii(identity.make.clone()));
    block.ifd0.set(tag::MODEL, Value::Ascii(identity.model.clone()));
    block
        .ifd0
        .set(tag::SOFTWARE, Value::Ascii(identity.software.clone()));
    block.ifd0.set(tag::DATE_TIME, Value::Ascii(date));

    if let Some(exposure) = metadata.exposure_time_us.and_then(|us| u32::try_from(us).ok()) {
        block
            .exif
            .set(tag::EXPOSURE_TIME, Value::Rational(exposure, 1_000_000));
    }
    if let Some(iso) = metadata.iso_rating() {
        block.exif.set(tag::ISO_SPEED_RATINGS, Value::Short(iso));
    }

    Ok(block)
}

fn fits(exif_len: usize, thumb_len: usize) -> bool {
    exif_len + thumb_len + 2 <= MAX_SEGMENT_LEN
}

/// Build the metadata block for one frame, with an optional thumbnail.
///
/// The thumbnail is compressed at the requested quality and, while the whole
/// segment would overflow its 16-bit length, retried in steps of
/// [`THUMBNAIL_QUALITY_STEP`] down to quality 0.
pub fn embed(
    metadata: &CaptureMetadata,
    identity: &DeviceIdentity,
    now: OffsetDateTime,
    thumbnail: Option<ThumbnailRequest<'_>>,
) -> Result<MetadataBlock> {
    let mut block = build_tags(metadata, identity, now)?;

    let Some(request) = thumbnail else {
        let exif = block.serialize();
        if !fits(exif.len(), 0) {
            return Err(EncodeError::metadata(format!(
                "metadata block of {} bytes exceeds segment limit",
                exif.len()
            )));
        }
        return Ok(MetadataBlock {
            exif,
            thumbnail: None,
            thumbnail_quality: None,
        });
    };

    let config = request.config;
    let (width, height) = match (u16::try_from(config.width), u16::try_from(config.height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(EncodeError::metadata(format!(
                "thumbnail {}x{} too large",
                config.width, config.height
            )))
        }
    };

    // Placeholder offset and length occupy their final space.
    let mut ifd1 = Directory::default();
    ifd1.set(tag::IMAGE_WIDTH, Value::Short(width));
    ifd1.set(tag::IMAGE_LENGTH, Value::Short(height));
    ifd1.set(tag::COMPRESSION, Value::Short(COMPRESSION_JPEG));
    ifd1.set(tag::JPEG_INTERCHANGE_FORMAT, Value::Long(0));
    ifd1.set(tag::JPEG_INTERCHANGE_FORMAT_LENGTH, Value::Long(0));
    block.ifd1 = Some(ifd1);
    let exif_len = block.serialize().len();

    let thumb = Thumbnail::render(request.image, config.width, config.height)?;
    let mut quality = config.quality;
    let mut attempts = 0;
    let mut last_len = 0;
    let jpeg = loop {
        if quality == 0 || attempts >= MAX_THUMBNAIL_ATTEMPTS {
            return Err(EncodeError::ThumbnailTooLarge { attempts, last_len });
        }
        let jpeg = thumb.compress(quality)?;
        attempts += 1;
        last_len = jpeg.len();
        if fits(exif_len, jpeg.len()) {
            break jpeg;
        }
        warn!(quality, len = jpeg.len(), "thumbnail too large, lowering quality");
        quality = quality.saturating_sub(THUMBNAIL_QUALITY_STEP);
    };
    debug!(quality, len = jpeg.len(), attempts, "thumbnail ready");

    if let Some(ifd1) = block.ifd1.as_mut() {
        let offset = (exif_len - EXIF_HEADER.len()) as u32;
        ifd1.set(tag::JPEG_INTERCHANGE_FORMAT, Value::Long(offset));
        ifd1.set(tag::JPEG_INTERCHANGE_FORMAT_LENGTH, Value::Long(jpeg.len() as u32));
    }
    let exif = block.serialize();
    debug_assert_eq!(exif.len(), exif_len);

    Ok(MetadataBlock {
        exif,
        thumbnail: Some(jpeg),
        thumbnail_quality: Some(quality),
    })
}
