use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::capture::frame::PlanarImage;
use crate::encoder::jpeg;
use crate::error::{EncodeError, Result};

/// Downscaled copy of a 4:2:0 frame, ready to be compressed at any quality.
pub struct Thumbnail {
    width: u32,
    height: u32,
    y: GrayImage,
    u: GrayImage,
    v: GrayImage,
}

impl Thumbnail {
    /// Resample every plane of `image` to `width` x `height` (chroma to half).
    pub fn render(image: &PlanarImage<'_>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EncodeError::metadata("thumbnail dimensions must be non-zero"));
        }
        let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));

        let y = plane(image.y, image.y_stride, image.width, image.height);
        let u = plane(image.u, image.c_stride, image.chroma_width(), image.chroma_height());
        let v = plane(image.v, image.c_stride, image.chroma_width(), image.chroma_height());

        Ok(Self {
            width,
            height,
            y: imageops::resize(&y, width, height, FilterType::Triangle),
            u: imageops::resize(&u, cw, ch, FilterType::Triangle),
            v: imageops::resize(&v, cw, ch, FilterType::Triangle),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Compress the thumbnail as a standalone JPEG.
    pub fn compress(&self, quality: u8) -> Result<Vec<u8>> {
        let planes = PlanarImage {
            width: self.width,
            height: self.height,
            y: self.y.as_raw(),
            u: self.u.as_raw(),
            v: self.v.as_raw(),
            y_stride: self.width as usize,
            c_stride: self.width.div_ceil(2) as usize,
        };
        jpeg::compress(&planes, quality)
    }
}

fn plane(data: &[u8], stride: usize, width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        image::Luma([data[y as usize * stride + x as usize]])
    })
}
