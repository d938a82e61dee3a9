//! One file per segment, named from a printf-style pattern

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{EncodeError, Result};
use crate::output::Sink;
use crate::OutputConfig;

enum Target {
    /// Segments are accepted and dropped
    Discard,
    Stdout,
    Pattern(String),
}

/// Writes each delivered segment to its own file.
///
/// `path` may be empty (discard), `-` (stdout) or a pattern containing one
/// `%d` / `%0Nd` counter, e.g. `frame%04d.jpg`.
pub struct FileSink {
    target: Target,
    count: u32,
    wrap: u32,
    flush: bool,
}

impl FileSink {
    pub fn new(config: &OutputConfig) -> Result<Self> {
        let target = match config.path.as_str() {
            "" => Target::Discard,
            "-" => Target::Stdout,
            pattern => {
                expand(pattern, 0).ok_or_else(|| {
                    EncodeError::InvalidConfig(format!("bad output pattern {pattern:?}"))
                })?;
                Target::Pattern(pattern.to_owned())
            }
        };

        Ok(Self {
            target,
            count: 0,
            wrap: config.wrap,
            flush: config.flush,
        })
    }

    fn next_path(&mut self, pattern: &str) -> PathBuf {
        let path = expand(pattern, self.count).unwrap_or_else(|| pattern.to_owned());
        self.count += 1;
        if self.wrap > 0 {
            self.count %= self.wrap;
        }
        PathBuf::from(path)
    }
}

impl Sink for FileSink {
    fn deliver(&mut self, data: &[u8], timestamp_us: i64, _is_final_segment: bool) -> io::Result<()> {
        match &self.target {
            Target::Discard => Ok(()),
            Target::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(data)?;
                if self.flush {
                    out.flush()?;
                }
                Ok(())
            }
            Target::Pattern(pattern) => {
                let pattern = pattern.clone();
                let path = self.next_path(&pattern);
                let mut file = File::create(&path)?;
                debug!(
                    "Writing {} bytes (t={}us) to {}",
                    data.len(),
                    timestamp_us,
                    path.display()
                );
                file.write_all(data)?;
                if self.flush {
                    file.sync_data()?;
                }
                Ok(())
            }
        }
    }
}

/// Substitute `n` for the first `%d` or `%0Nd` in `pattern`. A pattern without
/// a counter is used as-is (every frame overwrites the same file).
fn expand(pattern: &str, n: u32) -> Option<String> {
    let Some(start) = pattern.find('%') else {
        return Some(pattern.to_owned());
    };
    let rest = &pattern[start + 1..];
    let end = rest.find('d')?;
    let flags = &rest[..end];

    let value = if flags.is_empty() {
        n.to_string()
    } else {
        let width: usize = flags.strip_prefix('0')?.parse().ok()?;
        format!("{n:0width$}")
    };
    Some(format!("{}{}{}", &pattern[..start], value, &rest[end + 1..]))
}
