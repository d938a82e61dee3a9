//! Error types shared by the encode pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EncodeError>;

/// Everything that can go wrong between submission and delivery.
///
/// Only `QueueClosed` is recoverable by the caller. Every other variant is
/// fatal to the pipeline instance: a frame that cannot be encoded or delivered
/// would leave a hole in the sequence, so the whole pipeline stops instead.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("submission queue is closed")]
    QueueClosed,

    #[error("compression failed: {0}")]
    CompressionFailure(String),

    #[error("cannot build metadata block: {0}")]
    MetadataAllocationFailure(String),

    #[error("thumbnail still too large after {attempts} attempts ({last_len} bytes)")]
    ThumbnailTooLarge { attempts: u32, last_len: usize },

    #[error("sink write failed: {0}")]
    SinkWriteFailure(#[source] std::io::Error),

    #[error("encode worker failed: {0}")]
    Worker(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EncodeError {
    pub fn compression(reason: impl Into<String>) -> Self {
        Self::CompressionFailure(reason.into())
    }

    pub fn metadata(reason: impl Into<String>) -> Self {
        Self::MetadataAllocationFailure(reason.into())
    }

    /// Whether the caller may keep using the pipeline after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueClosed)
    }
}
