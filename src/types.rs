// src/types.rs

use crate::analysis::cascade::CascadeConfig;
use crate::analysis::path_tracker::PathTrackerConfig;
use crate::pipeline::stages::LaneConfig;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub history: HistoryConfig,
    pub cascade: CascadeConfig,
    pub lanes: Vec<LaneConfig>,
    pub tracker: PathTrackerConfig,
    pub detectors: DetectorsConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Raw frames kept for backward search
    pub frame_capacity: usize,
    /// Frame-index window of finalized bundles kept for path stitching
    pub bundle_window: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 120, // 4s at 30fps
            bundle_window: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    pub cheap_url: Option<String>,
    pub heavy_url: Option<String>,
    pub timeout_secs: u64,
    /// JPEG quality of the frames posted to both detectors
    pub jpeg_quality: u8,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            cheap_url: None,
            heavy_url: None,
            timeout_secs: 10,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub frames_dir: String,
    /// Optional directory of same-named foreground masks
    pub masks_dir: Option<String>,
    pub source_id: String,
    pub fps: f32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frames_dir: "frames".to_string(),
            masks_dir: None,
            source_id: "camera-0".to_string(),
            fps: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub jsonl_path: Option<String>,
    pub http_url: Option<String>,
    pub queue_size: usize,
    pub timeout_secs: u64,
    /// Attach a JPEG crop of the best bundle to each trace
    pub snapshot: bool,
    pub snapshot_quality: u8,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            jsonl_path: Some("traces.jsonl".to_string()),
            http_url: None,
            queue_size: 64,
            timeout_secs: 10,
            snapshot: false,
            snapshot_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "trace_cascade=info".to_string(),
        }
    }
}

/// A decoded frame plus capture metadata. Shared read-only between stages,
/// the history buffer and any bundle anchored to it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Global, strictly increasing across the run
    pub index: u64,
    /// Index within the current input file
    pub file_index: u64,
    pub source_id: String,
    pub timestamp_ms: f64,
    pub fps: f32,
    pub keyframe_index: u64,
    pub image: RgbImage,
    /// Foreground/motion mask, when a subtractor has produced one
    pub foreground: Option<GrayImage>,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self {
            index,
            file_index: index,
            source_id: String::new(),
            timestamp_ms: 0.0,
            fps: 0.0,
            keyframe_index: 0,
            image,
            foreground: None,
        }
    }

    pub fn with_foreground(mut self, mask: GrayImage) -> Self {
        self.foreground = Some(mask);
        self
    }

    pub fn with_timing(mut self, timestamp_ms: f64, fps: f32) -> Self {
        self.timestamp_ms = timestamp_ms;
        self.fps = fps;
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>, file_index: u64) -> Self {
        self.source_id = source_id.into();
        self.file_index = file_index;
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn into_shared(self) -> SharedFrame {
        Arc::new(self)
    }
}
