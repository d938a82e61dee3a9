//! Per-frame capture metadata and the human-readable frame info line

use std::fmt::Write;

/// Capture metadata attached by the capture source. Every field is optional;
/// absent values are never invented downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureMetadata {
    pub exposure_time_us: Option<i32>,
    pub analogue_gain: Option<f32>,
    pub digital_gain: Option<f32>,
    /// Red and blue colour gains
    pub colour_gains: Option<[f32; 2]>,
    pub focus_fom: Option<f32>,
    pub lux: Option<f32>,
    pub ae_locked: Option<bool>,
    pub colour_temperature: Option<u32>,
    pub frame_duration_us: Option<i64>,
}

impl CaptureMetadata {
    /// ISO-equivalent rating, `round(100 * analogue * digital)`, when both gains
    /// were reported.
    pub fn iso_rating(&self) -> Option<u16> {
        let (ag, dg) = (self.analogue_gain?, self.digital_gain?);
        let iso = (100.0 * f64::from(ag) * f64::from(dg)).round();
        Some(iso.clamp(0.0, f64::from(u16::MAX)) as u16)
    }
}

const TOKENS: [&str; 12] = [
    "%frame", "%fps", "%exp", "%ag", "%dg", "%rg", "%bg", "%focus", "%aelock", "%temp", "%fd",
    "%lux",
];

/// Snapshot used to render a per-frame status line such as
/// `"frame=%frame exposure=%exp analog_gain=%ag"`.
#[derive(Debug, Clone)]
pub struct FrameInfo<'a> {
    pub sequence: u64,
    pub fps: f32,
    pub metadata: &'a CaptureMetadata,
}

impl<'a> FrameInfo<'a> {
    pub fn new(sequence: u64, fps: f32, metadata: &'a CaptureMetadata) -> Self {
        Self {
            sequence,
            fps,
            metadata,
        }
    }

    /// Expand every known token in `template`. Missing values print as zero.
    pub fn format(&self, template: &str) -> String {
        let m = self.metadata;
        let mut out = template.to_owned();
        for token in TOKENS {
            if !out.contains(token) {
                continue;
            }
            let mut value = String::new();
            let _ = match token {
                "%frame" => write!(value, "{}", self.sequence),
                "%fps" => write!(value, "{:.2}", self.fps),
                "%exp" => write!(value, "{:.2}", m.exposure_time_us.unwrap_or(0) as f32),
                "%ag" => write!(value, "{:.2}", m.analogue_gain.unwrap_or(0.0)),
                "%dg" => write!(value, "{:.2}", m.digital_gain.unwrap_or(0.0)),
                "%rg" => write!(value, "{:.2}", m.colour_gains.map_or(0.0, |g| g[0])),
                "%bg" => write!(value, "{:.2}", m.colour_gains.map_or(0.0, |g| g[1])),
                "%focus" => write!(value, "{:.2}", m.focus_fom.unwrap_or(0.0)),
                "%aelock" => write!(value, "{}", u8::from(m.ae_locked.unwrap_or(false))),
                "%temp" => write!(value, "{}", m.colour_temperature.unwrap_or(0)),
                "%fd" => write!(value, "{}", m.frame_duration_us.unwrap_or(0)),
                "%lux" => write!(value, "{:.2}", m.lux.unwrap_or(0.0)),
                _ => Ok(()),
            };
            out = out.replace(token, &value);
        }
        out
    }
}
