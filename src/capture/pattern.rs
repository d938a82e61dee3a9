//! Synthetic 4:2:0 capture source used by the demo binary and tests

use std::time::Instant;

use bytes::BytesMut;
use tracing::{info, instrument};

use crate::capture::frame::{Geometry, RawFrame};
use crate::capture::info::CaptureMetadata;
use crate::CaptureConfig;

/// Moving gradient test pattern with plausible per-frame camera metadata
pub struct TestPattern {
    geometry: Geometry,
    fps: u32,
    frame: u64,
    started: Instant,
}

impl TestPattern {
    pub fn new(config: &CaptureConfig) -> Self {
        let geometry = Geometry::yuv420(config.width, config.height);
        info!(
            "Test pattern source {}x{} stride {} @ {} fps",
            geometry.width, geometry.height, geometry.stride, config.fps
        );

        Self {
            geometry,
            fps: config.fps.max(1),
            frame: 0,
            started: Instant::now(),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Render the next frame
    #[instrument(skip(self), fields(frame = self.frame))]
    pub fn next_frame(&mut self) -> RawFrame {
        let g = self.geometry;
        let shift = (self.frame * 4) as usize;
        let mut buf = BytesMut::zeroed(g.buffer_len());

        let (luma, chroma) = buf.split_at_mut(g.stride as usize * g.height as usize);
        for (y, row) in luma.chunks_exact_mut(g.stride as usize).enumerate() {
            for (x, px) in row.iter_mut().take(g.width as usize).enumerate() {
                *px = ((x + y + shift) & 0xff) as u8;
            }
        }

        let c_stride = g.chroma_stride() as usize;
        let c_len = c_stride * g.chroma_height() as usize;
        let (u, v) = chroma.split_at_mut(c_len);
        for (y, (u_row, v_row)) in u
            .chunks_exact_mut(c_stride)
            .zip(v.chunks_exact_mut(c_stride))
            .enumerate()
        {
            for x in 0..g.chroma_width() as usize {
                u_row[x] = (96 + ((x * 2 + shift) & 0x3f)) as u8;
                v_row[x] = (96 + ((y * 2 + shift) & 0x3f)) as u8;
            }
        }

        let metadata = CaptureMetadata {
            exposure_time_us: Some(1_000_000 / self.fps as i32),
            analogue_gain: Some(1.0 + (self.frame % 8) as f32 * 0.5),
            digital_gain: Some(1.0),
            colour_gains: Some([1.8, 1.6]),
            focus_fom: Some(100.0),
            lux: Some(400.0),
            ae_locked: Some(false),
            colour_temperature: Some(5000),
            frame_duration_us: Some(1_000_000 / i64::from(self.fps)),
        };

        let timestamp_us = self.started.elapsed().as_micros() as i64;
        self.frame += 1;

        RawFrame::new(buf.freeze(), g, metadata, timestamp_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_geometry() {
        let config = CaptureConfig {
            width: 50,
            height: 30,
            fps: 10,
            frames: 2,
        };
        let mut source = TestPattern::new(&config);
        let first = source.next_frame();
        let second = source.next_frame();

        assert_eq!(first.data.len(), first.geometry.buffer_len());
        assert!(first.geometry.planes(&first.data).is_ok());
        assert_ne!(first.data, second.data);
        assert_eq!(first.metadata.exposure_time_us, Some(100_000));
        assert!(second.timestamp_us >= first.timestamp_us);
    }
}
