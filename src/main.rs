//! stillpipe demo: encode a burst of synthetic frames through the pipeline

use std::path::PathBuf;
use std::time::Instant;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use stillpipe::capture::{FrameInfo, TestPattern};
use stillpipe::{encoder, output, Config, Pipeline};

const INFO_TEXT: &str = "#%frame (%fps fps) exp %exp ag %ag dg %dg";

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stillpipe=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .finish();
    #[cfg(feature = "profiling")]
    let subscriber = {
        use tracing_subscriber::layer::SubscriberExt;
        subscriber.with(tracing_tracy::TracyLayer::default())
    };
    subscriber.init();

    info!("stillpipe launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    let sink = output::create(&config.output)?;
    let encoder = encoder::create(&config.encoder);
    let pipeline = Pipeline::new(&config.encoder, encoder, sink, None)?;

    let mut source = TestPattern::new(&config.capture);
    let started = Instant::now();
    for _ in 0..config.capture.frames {
        let frame = source.next_frame();
        if config.encoder.verbose {
            let fps = source.fps() as f32;
            let next = pipeline.report().submitted;
            info!("{}", FrameInfo::new(next, fps, &frame.metadata).format(INFO_TEXT));
        }
        if let Err(err) = pipeline.submit(frame) {
            // The pipeline aborted; shutdown reports why
            warn!("Stopping capture: {}", err);
            break;
        }
    }

    let report = pipeline.shutdown()?;
    let elapsed = started.elapsed();
    info!(
        "Delivered {} frames ({} bytes) in {:.2?}, average encode {:?}",
        report.delivered, report.encoded_bytes, elapsed, report.average_encode
    );

    info!("stillpipe shutting down");
    Ok(())
}
