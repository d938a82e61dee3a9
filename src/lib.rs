pub mod capture;
pub mod encoder;
pub mod error;
pub mod output;
pub mod pipeline;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use encoder::Codec;
pub use error::{EncodeError, Result};
pub use pipeline::{Pipeline, PipelineReport};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub encoder: EncoderConfig,
    pub output: OutputConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub workers: usize,
    /// 0-100, standard JPEG scale
    pub quality: u8,
    pub thumbnail: ThumbnailConfig,
    /// Per-frame logs at info level; never changes output
    pub verbose: bool,
    /// Pin worker threads to distinct cores
    pub pin_workers: bool,
    pub make: String,
    pub model: String,
    pub software: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub width: u32,
    pub height: u32,
    /// 0 disables the thumbnail
    pub quality: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Empty discards, `-` is stdout, otherwise a `%d`/`%0Nd` filename pattern
    pub path: String,
    /// Filename counter modulus, 0 for none
    pub wrap: u32,
    pub flush: bool,
}

/// Synthetic source used by the demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Jpeg,
            workers: 4,
            quality: 93,
            thumbnail: ThumbnailConfig::default(),
            verbose: false,
            pin_workers: false,
            make: "Raspberry Pi".into(),
            model: "unknown".into(),
            software: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            quality: 0,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            frames: 30,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `STILLPIPE__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("STILLPIPE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let encoder = &self.encoder;
        if encoder.workers == 0 {
            return Err(EncodeError::InvalidConfig("workers must be at least 1".into()));
        }
        if encoder.quality > 100 {
            return Err(EncodeError::InvalidConfig(format!(
                "quality {} out of range 0-100",
                encoder.quality
            )));
        }
        let thumb = &encoder.thumbnail;
        if thumb.quality > 100 {
            return Err(EncodeError::InvalidConfig(format!(
                "thumbnail quality {} out of range 0-100",
                thumb.quality
            )));
        }
        if thumb.quality > 0 && (thumb.width == 0 || thumb.height == 0) {
            return Err(EncodeError::InvalidConfig(
                "thumbnail enabled with zero dimensions".into(),
            ));
        }
        Ok(())
    }
}
