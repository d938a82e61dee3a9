pub mod file;

use std::io;

pub use file::FileSink;

use crate::error::Result;
use crate::OutputConfig;

/// Downstream consumer of finished segments.
///
/// Called from the reassembly thread only, exactly once per frame and in
/// submission order. An error is fatal to the pipeline.
pub trait Sink: Send {
    fn deliver(&mut self, data: &[u8], timestamp_us: i64, is_final_segment: bool) -> io::Result<()>;
}

impl<F> Sink for F
where
    F: FnMut(&[u8], i64, bool) -> io::Result<()> + Send,
{
    fn deliver(&mut self, data: &[u8], timestamp_us: i64, is_final_segment: bool) -> io::Result<()> {
        self(data, timestamp_us, is_final_segment)
    }
}

/// Build the sink described by `config`.
pub fn create(config: &OutputConfig) -> Result<Box<dyn Sink>> {
    Ok(Box::new(FileSink::new(config)?))
}
