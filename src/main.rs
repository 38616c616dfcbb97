//! beamview - Headless Entry Point
//!
//! Runs the live mapping pipeline against the simulated detector, logs map
//! progress as a GUI would see it, then re-reduces the buffered frames with a
//! different recipe.
//!
//! Usage: `beamview [CONFIG_PATH]`

use anyhow::Context;
use beamview::{
    acquisition::MockDetector,
    analysis::MapStatistics,
    config::{default_config_path, AppConfig, LoggingSettings},
    pipeline::{FrameRange, LiveController, MapNotification, PostProcessor, ReductionRecipe, Roi},
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log map statistics every this many generations
const STATS_EVERY: u64 = 64;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let (config, load_error) = load_config(config_path);

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&config.logging);

    tracing::info!("Starting beamview {}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = load_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    let controller = LiveController::new(&config).context("Failed to start live controller")?;

    // Stand-in for the GUI: follow notifications and pull snapshots
    let updates = controller.subscribe();
    let viewer = {
        let buffer = controller.buffer();
        std::thread::Builder::new()
            .name("beamview-viewer".to_string())
            .spawn(move || {
                let mut last_logged = 0;
                for notification in updates.iter() {
                    match notification {
                        MapNotification::Updated(generation) => {
                            if generation.get() >= last_logged + STATS_EVERY {
                                last_logged = generation.get();
                                tracing::info!(
                                    "Map at {} ({} frames buffered)",
                                    generation,
                                    buffer.len()
                                );
                            }
                        }
                        MapNotification::Reset(generation) => {
                            tracing::info!("Map reset at {}", generation);
                        }
                        MapNotification::Stopped => break,
                    }
                }
            })
            .context("Failed to spawn viewer thread")?
    };

    controller.start()?;

    let detector = MockDetector::new(64, 64)
        .with_scan(24, 24)
        .with_noise(2.0)
        .with_monitor(1.0e5);
    let total = detector.scan_len();

    for (i, frame) in detector.enumerate() {
        // Simulate the operator pausing the map halfway through the scan
        if i == total / 2 {
            controller.pause()?;
        }
        if i == total / 2 + 16 {
            controller.resume()?;
        }
        if let Err(e) = controller.submit(frame) {
            tracing::warn!("Frame {} rejected: {}", i, e);
        }
    }

    if !controller.wait_idle(Duration::from_secs(30)) {
        tracing::warn!("Reduction did not finish within 30s");
    }

    let live = controller.get_latest_map();
    let stats = MapStatistics::from_snapshot(&live);
    tracing::info!("Live stats: {:?}", controller.stats());
    tracing::info!("Live map: {}", serde_json::to_string(&stats)?);

    // Re-reduce everything with a peak finder, leaving the live map alone
    let post = PostProcessor::from_config(controller.buffer(), &config);
    let handle = post.start_batch(ReductionRecipe::peak_find(Roi::Full), FrameRange::All)?;
    tracing::info!("Batch {} running", handle.id());
    let batch = handle.wait()?;
    let batch_stats = MapStatistics::from_snapshot(&batch.snapshot);
    tracing::info!(
        "Batch map: {} processed, {} skipped, {} failed; {}",
        batch.processed,
        batch.skipped.len(),
        batch.failed.len(),
        serde_json::to_string(&batch_stats)?
    );

    controller.stop()?;
    if viewer.join().is_err() {
        tracing::error!("Viewer thread panicked");
    }

    tracing::info!("Shutting down...");
    Ok(())
}

/// Load the config before logging exists; the error is reported once it does.
fn load_config(path: Option<PathBuf>) -> (AppConfig, Option<String>) {
    let Some(path) = path.or_else(default_config_path) else {
        return (AppConfig::default(), None);
    };
    if !path.exists() {
        return (AppConfig::default(), None);
    }
    match AppConfig::load(&path) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e.to_string())),
    }
}

fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    let (file_layer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "beamview.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}
