//! Baseline JPEG compressor fed with raw 4:2:0 planes, one band at a time.
//!
//! Each band covers 16 luma rows and 8 rows of each chroma plane, i.e. one row
//! of 16x16 MCUs. Rows past the bottom of the image are clamped to the last
//! valid row of their plane, columns past the right edge likewise, so the
//! final partial band repeats real image content instead of reading beyond
//! the buffer.

use std::f32::consts::PI;
use std::sync::OnceLock;

use tracing::{instrument, trace};

use crate::capture::frame::PlanarImage;
use crate::encoder::tables::{
    scaled_quant, HuffmanSpec, CHROMA_AC, CHROMA_DC, CHROMA_QUANT, LUMA_AC, LUMA_DC, LUMA_QUANT,
    ZIGZAG,
};
use crate::error::{EncodeError, Result};

/// Bytes of encoder header (SOI + JFIF APP0) preceding the quantisation tables.
/// Splicing replaces exactly this prefix with the metadata segment.
pub const HEADER_LEN: usize = 20;

pub const LUMA_BAND_ROWS: u32 = 16;
pub const CHROMA_BAND_ROWS: u32 = 8;

const SOI: u16 = 0xFFD8;
const APP0: u16 = 0xFFE0;
const DQT: u16 = 0xFFDB;
const SOF0: u16 = 0xFFC0;
const DHT: u16 = 0xFFC4;
const SOS: u16 = 0xFFDA;
const EOI: u16 = 0xFFD9;

/// Compress `image` to a self-contained JFIF stream at `quality` (0..=100).
#[instrument(level = "trace", skip(image), fields(width = image.width, height = image.height))]
pub fn compress(image: &PlanarImage<'_>, quality: u8) -> Result<Vec<u8>> {
    if image.width == 0 || image.height == 0 {
        return Err(EncodeError::compression("empty image"));
    }
    let (width, height) = match (u16::try_from(image.width), u16::try_from(image.height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(EncodeError::compression(format!(
                "image {}x{} exceeds baseline limits",
                image.width, image.height
            )))
        }
    };

    let mut encoder = BandEncoder::new(quality, image.width);
    encoder.write_headers(width, height);

    let mut next_scanline = 0;
    while next_scanline < image.height {
        let y_rows: [&[u8]; LUMA_BAND_ROWS as usize] =
            std::array::from_fn(|i| image.luma_row(next_scanline + i as u32));
        let chroma_base = next_scanline / 2;
        let c_rows: [(&[u8], &[u8]); CHROMA_BAND_ROWS as usize] =
            std::array::from_fn(|i| image.chroma_rows(chroma_base + i as u32));

        encoder.write_band(&y_rows, &c_rows);
        next_scanline += LUMA_BAND_ROWS;
    }

    let out = encoder.finish();
    trace!(len = out.len(), "compressed");
    Ok(out)
}

fn dct_basis() -> &'static [[f32; 8]; 8] {
    static BASIS: OnceLock<[[f32; 8]; 8]> = OnceLock::new();
    BASIS.get_or_init(|| {
        let mut basis = [[0f32; 8]; 8];
        for (u, row) in basis.iter_mut().enumerate() {
            let scale = if u == 0 { 0.5 / 2f32.sqrt() } else { 0.5 };
            for (x, value) in row.iter_mut().enumerate() {
                *value = scale * ((2 * x + 1) as f32 * u as f32 * PI / 16.0).cos();
            }
        }
        basis
    })
}

/// Canonical Huffman code lookup: (code, length) per symbol.
struct HuffmanTable {
    codes: [(u16, u8); 256],
}

impl HuffmanTable {
    fn build(spec: &HuffmanSpec) -> Self {
        let mut codes = [(0u16, 0u8); 256];
        let mut code = 0u32;
        let mut symbols = spec.symbols.iter();
        for (len, &count) in spec.counts.iter().enumerate() {
            for _ in 0..count {
                if let Some(&symbol) = symbols.next() {
                    codes[symbol as usize] = (code as u16, len as u8 + 1);
                }
                code += 1;
            }
            code <<= 1;
        }
        Self { codes }
    }

    fn get(&self, symbol: u8) -> (u16, u8) {
        self.codes[symbol as usize]
    }
}

struct Component {
    quant: [u16; 64],
    dc: HuffmanTable,
    ac: HuffmanTable,
    prev_dc: i32,
}

/// Entropy-coded output with 0xFF byte stuffing.
struct BitWriter {
    out: Vec<u8>,
    buf: u32,
    count: u32,
}

impl BitWriter {
    fn put(&mut self, bits: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.buf = (self.buf << len) | (bits & ((1 << len) - 1));
        self.count += len;
        while self.count >= 8 {
            let byte = (self.buf >> (self.count - 8)) as u8;
            self.out.push(byte);
            if byte == 0xFF {
                self.out.push(0x00);
            }
            self.count -= 8;
        }
        self.buf &= (1 << self.count) - 1;
    }

    fn put_code(&mut self, (code, len): (u16, u8)) {
        self.put(u32::from(code), u32::from(len));
    }

    /// Pad the final partial byte with 1-bits.
    fn flush(&mut self) {
        if self.count > 0 {
            let pad = 8 - self.count;
            self.put((1 << pad) - 1, pad);
        }
    }
}

struct BandEncoder {
    w: BitWriter,
    width: u32,
    luma: Component,
    cb: Component,
    cr: Component,
}

impl BandEncoder {
    fn new(quality: u8, width: u32) -> Self {
        let luma_quant = scaled_quant(&LUMA_QUANT, quality);
        let chroma_quant = scaled_quant(&CHROMA_QUANT, quality);
        let chroma = || Component {
            quant: chroma_quant,
            dc: HuffmanTable::build(&CHROMA_DC),
            ac: HuffmanTable::build(&CHROMA_AC),
            prev_dc: 0,
        };

        Self {
            w: BitWriter {
                out: Vec::with_capacity(4096),
                buf: 0,
                count: 0,
            },
            width,
            luma: Component {
                quant: luma_quant,
                dc: HuffmanTable::build(&LUMA_DC),
                ac: HuffmanTable::build(&LUMA_AC),
                prev_dc: 0,
            },
            cb: chroma(),
            cr: chroma(),
        }
    }

    fn marker(&mut self, marker: u16) {
        self.w.out.extend_from_slice(&marker.to_be_bytes());
    }

    fn segment(&mut self, marker: u16, body: &[u8]) {
        self.marker(marker);
        self.w
            .out
            .extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
        self.w.out.extend_from_slice(body);
    }

    fn write_headers(&mut self, width: u16, height: u16) {
        self.marker(SOI);
        // JFIF 1.01, no density units, 1:1, no thumbnail
        self.segment(
            APP0,
            &[b'J', b'F', b'I', b'F', 0, 1, 1, 0, 0, 1, 0, 1, 0, 0],
        );
        debug_assert_eq!(self.w.out.len(), HEADER_LEN);

        let mut dqt = Vec::with_capacity(130);
        for (id, quant) in [(0u8, &self.luma.quant), (1u8, &self.cb.quant)] {
            dqt.push(id);
            dqt.extend(ZIGZAG.iter().map(|&n| quant[n] as u8));
        }
        self.segment(DQT, &dqt);

        let [w_hi, w_lo] = width.to_be_bytes();
        let [h_hi, h_lo] = height.to_be_bytes();
        self.segment(
            SOF0,
            &[8, h_hi, h_lo, w_hi, w_lo, 3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1],
        );

        let mut dht = Vec::with_capacity(432);
        for (class_id, spec) in [
            (0x00, &LUMA_DC),
            (0x10, &LUMA_AC),
            (0x01, &CHROMA_DC),
            (0x11, &CHROMA_AC),
        ] {
            dht.push(class_id);
            dht.extend_from_slice(&spec.counts);
            dht.extend_from_slice(spec.symbols);
        }
        self.segment(DHT, &dht);

        self.segment(SOS, &[3, 1, 0x00, 2, 0x11, 3, 0x11, 0, 63, 0]);
    }

    /// Encode one row of MCUs from 16 luma rows and 8 (Cb, Cr) row pairs.
    fn write_band(&mut self, y_rows: &[&[u8]; 16], c_rows: &[(&[u8], &[u8]); 8]) {
        let mcus = self.width.div_ceil(16) as usize;
        let mut block = [0f32; 64];

        for mcu in 0..mcus {
            let x0 = mcu * 16;
            for (dy, dx) in [(0, 0), (0, 8), (8, 0), (8, 8)] {
                load_block(&mut block, |r| y_rows[dy + r], x0 + dx);
                self.luma.encode(&block, &mut self.w);
            }

            load_block(&mut block, |r| c_rows[r].0, mcu * 8);
            self.cb.encode(&block, &mut self.w);
            load_block(&mut block, |r| c_rows[r].1, mcu * 8);
            self.cr.encode(&block, &mut self.w);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.w.flush();
        self.marker(EOI);
        self.w.out
    }
}

/// Level-shifted 8x8 samples starting at column `x0`; columns past the end of
/// a row repeat its last sample.
fn load_block<'a>(block: &mut [f32; 64], row: impl Fn(usize) -> &'a [u8], x0: usize) {
    for r in 0..8 {
        let samples = row(r);
        let last = samples.len() - 1;
        for c in 0..8 {
            block[r * 8 + c] = f32::from(samples[(x0 + c).min(last)]) - 128.0;
        }
    }
}

impl Component {
    fn encode(&mut self, block: &[f32; 64], w: &mut BitWriter) {
        let basis = dct_basis();

        // separable forward DCT: rows, then columns
        let mut rows = [0f32; 64];
        for y in 0..8 {
            for u in 0..8 {
                rows[y * 8 + u] = (0..8).map(|x| basis[u][x] * block[y * 8 + x]).sum();
            }
        }
        let mut coeffs = [0i32; 64];
        for v in 0..8 {
            for u in 0..8 {
                let f: f32 = (0..8).map(|y| basis[v][y] * rows[y * 8 + u]).sum();
                let i = v * 8 + u;
                coeffs[i] = (f / f32::from(self.quant[i])).round() as i32;
            }
        }

        let dc = coeffs[0];
        let (size, bits) = magnitude(dc - self.prev_dc);
        self.prev_dc = dc;
        w.put_code(self.dc.get(size as u8));
        w.put(bits, size);

        let mut run = 0u32;
        for &natural in &ZIGZAG[1..] {
            let value = coeffs[natural];
            if value == 0 {
                run += 1;
                continue;
            }
            while run > 15 {
                w.put_code(self.ac.get(0xF0));
                run -= 16;
            }
            let (size, bits) = magnitude(value);
            w.put_code(self.ac.get(((run << 4) | size) as u8));
            w.put(bits, size);
            run = 0;
        }
        if run > 0 {
            w.put_code(self.ac.get(0x00));
        }
    }
}

/// JPEG magnitude category and the additional bits encoding `value`.
fn magnitude(value: i32) -> (u32, u32) {
    let abs = value.unsigned_abs();
    let size = 32 - abs.leading_zeros();
    let bits = if value < 0 {
        (value - 1) as u32 & ((1 << size) - 1)
    } else {
        abs
    };
    (size, bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Geometry;

    fn flat_frame(geometry: Geometry, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = geometry.stride as usize * geometry.height as usize;
        let chroma = geometry.chroma_stride() as usize * geometry.chroma_height() as usize;
        let mut data = vec![y; luma];
        data.extend(std::iter::repeat(u).take(chroma));
        data.extend(std::iter::repeat(v).take(chroma));
        data
    }

    #[test]
    fn magnitude_categories() {
        assert_eq!(magnitude(0), (0, 0));
        assert_eq!(magnitude(1), (1, 1));
        assert_eq!(magnitude(-1), (1, 0));
        assert_eq!(magnitude(-3), (2, 0));
        assert_eq!(magnitude(5), (3, 5));
        assert_eq!(magnitude(-5), (3, 2));
    }

    #[test]
    fn huffman_codes_are_canonical() {
        let dc = HuffmanTable::build(&LUMA_DC);
        assert_eq!(dc.get(0), (0b00, 2));
        assert_eq!(dc.get(1), (0b010, 3));
        assert_eq!(dc.get(11), (0b1_1111_1110, 9));
    }

    #[test]
    fn stream_layout() {
        let geometry = Geometry::yuv420(24, 17);
        let data = flat_frame(geometry, 200, 128, 128);
        let jpeg = compress(&geometry.planes(&data).unwrap(), 90).unwrap();

        assert_eq!(&jpeg[..4], &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(&jpeg[6..11], b"JFIF\0");
        assert_eq!(&jpeg[HEADER_LEN..HEADER_LEN + 2], &[0xFF, 0xDB]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn single_pixel_image() {
        let geometry = Geometry::yuv420(1, 1);
        let data = flat_frame(geometry, 10, 20, 30);
        assert!(compress(&geometry.planes(&data).unwrap(), 75).is_ok());
    }
}
