// src/pipeline/metrics.rs
//
// Run-level counters. Cheap to clone: every field is a shared atomic, so a
// clone handed to a sink task updates the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub dropped_frames: Arc<AtomicU64>,
    pub lane_edges: Arc<AtomicU64>,
    pub cheap_calls: Arc<AtomicU64>,
    pub heavy_calls: Arc<AtomicU64>,
    pub detector_failures: Arc<AtomicU64>,
    pub detections_merged: Arc<AtomicU64>,
    pub escalations: Arc<AtomicU64>,
    pub stage_errors: Arc<AtomicU64>,
    pub paths_emitted: Arc<AtomicU64>,
    pub sink_successes: Arc<AtomicU64>,
    pub sink_failures: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub total_frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
            lane_edges: Arc::new(AtomicU64::new(0)),
            cheap_calls: Arc::new(AtomicU64::new(0)),
            heavy_calls: Arc::new(AtomicU64::new(0)),
            detector_failures: Arc::new(AtomicU64::new(0)),
            detections_merged: Arc::new(AtomicU64::new(0)),
            escalations: Arc::new(AtomicU64::new(0)),
            stage_errors: Arc::new(AtomicU64::new(0)),
            paths_emitted: Arc::new(AtomicU64::new(0)),
            sink_successes: Arc::new(AtomicU64::new(0)),
            sink_failures: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            total_frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn record_frame_time(&self, duration_us: u64) {
        self.frame_time_us.store(duration_us, Ordering::Relaxed);
        self.total_frame_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let total_us = self.total_frame_time_us.load(Ordering::Relaxed);
        MetricsSummary {
            total_frames: frames,
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            lane_edges: self.lane_edges.load(Ordering::Relaxed),
            cheap_calls: self.cheap_calls.load(Ordering::Relaxed),
            heavy_calls: self.heavy_calls.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            detections_merged: self.detections_merged.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
            paths_emitted: self.paths_emitted.load(Ordering::Relaxed),
            sink_successes: self.sink_successes.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            last_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            avg_frame_us: if frames > 0 { total_us / frames } else { 0 },
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub fps: f64,
    pub lane_edges: u64,
    pub cheap_calls: u64,
    pub heavy_calls: u64,
    pub detector_failures: u64,
    pub detections_merged: u64,
    pub escalations: u64,
    pub stage_errors: u64,
    pub paths_emitted: u64,
    pub sink_successes: u64,
    pub sink_failures: u64,
    pub last_frame_us: u64,
    pub avg_frame_us: u64,
    pub elapsed_secs: f64,
}
