// src/main.rs

use anyhow::{ensure, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trace_cascade::frame_buffer::FrameHistory;
use trace_cascade::inference::HttpDetector;
use trace_cascade::pipeline::{build_chain, MetricsSummary, StageSequencer};
use trace_cascade::trace_sink::{HttpSink, JsonlSink};
use trace_cascade::video_processor::ImageSequenceSource;
use trace_cascade::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🎯 trace-cascade starting ({})", config_path);
    config.validate().context("Invalid configuration")?;
    ensure!(
        config.detectors.cheap_url.is_some() && config.detectors.heavy_url.is_some(),
        "detectors.cheap_url and detectors.heavy_url are both required"
    );
    if config.lanes.is_empty() {
        warn!("No lanes configured: nothing will ever trigger the cascade");
    }
    info!("✓ Configuration loaded: {} lane(s)", config.lanes.len());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Ctrl-C received, stopping after the current frame");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let runtime = tokio::runtime::Handle::current();
    let (http_sink, http_handle) = match &config.sink.http_url {
        Some(url) => {
            let (sink, handle) = HttpSink::spawn(
                url.clone(),
                config.sink.timeout_secs,
                config.sink.queue_size,
                &runtime,
            )?;
            (Some(sink), Some(handle))
        }
        None => (None, None),
    };

    // The frame loop is synchronous and single-threaded; it owns every
    // piece of per-run state.
    let worker_config = config.clone();
    let worker_cancel = cancel.clone();
    let summary = tokio::task::spawn_blocking(move || -> Result<MetricsSummary> {
        let cfg = worker_config;
        let timeout = cfg.detectors.timeout_secs;
        let cheap_url = cfg.detectors.cheap_url.clone().unwrap_or_default();
        let heavy_url = cfg.detectors.heavy_url.clone().unwrap_or_default();
        let quality = cfg.detectors.jpeg_quality;
        let cheap = HttpDetector::new("cheap", cheap_url, timeout)?.with_jpeg_quality(quality);
        let heavy = HttpDetector::new("heavy", heavy_url, timeout)?.with_jpeg_quality(quality);

        let stages = build_chain(&cfg, Box::new(cheap), Box::new(heavy))?;
        let history = FrameHistory::new(cfg.history.frame_capacity)?;
        let mut sequencer = StageSequencer::new(stages, history)?;

        if let Some(path) = &cfg.sink.jsonl_path {
            sequencer = sequencer.with_sink(Box::new(JsonlSink::create(path)?));
        }
        if let Some(sink) = http_sink {
            sequencer = sequencer.with_sink(Box::new(sink));
        }
        if cfg.sink.snapshot {
            sequencer = sequencer.with_snapshots(cfg.sink.snapshot_quality);
        }

        let mut source = ImageSequenceSource::open(&cfg.source)?;
        sequencer.run(&mut source, &worker_cancel)
    })
    .await
    .context("Frame loop panicked")??;

    if let Some(handle) = http_handle {
        info!("🌐 Waiting for pending uploads...");
        match tokio::time::timeout(Duration::from_secs(config.sink.timeout_secs + 5), handle.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("🌐 Upload task failed: {}", e),
            Err(_) => warn!("🌐 Gave up waiting for uploads"),
        }
        info!(
            "🌐 Uploads: {} delivered, {} failed",
            handle.stats.delivered(),
            handle.stats.failed()
        );
    }

    info!("\n========================================");
    info!("✓ Run complete");
    info!("  Frames:        {} ({} dropped)", summary.total_frames, summary.dropped_frames);
    info!("  Lane edges:    {}", summary.lane_edges);
    info!(
        "  Detector calls: {} cheap / {} heavy ({} failed)",
        summary.cheap_calls, summary.heavy_calls, summary.detector_failures
    );
    info!("  Paths emitted: {}", summary.paths_emitted);
    info!("  Avg frame:     {} µs ({:.1} fps)", summary.avg_frame_us, summary.fps);
    info!("========================================");
    info!("{}", serde_json::to_string(&summary)?);

    Ok(())
}
