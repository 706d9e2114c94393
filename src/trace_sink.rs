// src/trace_sink.rs
//
// Persistence collaborators for emitted paths.
//
//   JsonlSink: one JSON object per line, flushed per record.
//   HttpSink: non-blocking hand-off to an async uploader task. `submit`
//             only enqueues; a full queue is a failure for that record and
//             never stalls the frame loop.

use crate::detection::{Detection, ItemPath};
use crate::inference::encode_jpeg;
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub frame_index: u64,
    pub file_index: u64,
    pub timestamp_ms: f64,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub event_id: String,
    pub emitted_at: DateTime<Utc>,
    pub source_id: String,
    pub track_id: Option<u64>,
    pub label: Option<String>,
    pub first_frame: u64,
    pub last_frame: u64,
    pub bundles: Vec<BundleRecord>,
    /// Base64 JPEG crop of the highest-confidence bundle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_base64: Option<String>,
}

impl TraceRecord {
    pub fn from_path(path: &ItemPath) -> Self {
        let bundles = path
            .bundles()
            .iter()
            .map(|b| BundleRecord {
                frame_index: b.frame_index(),
                file_index: b.frame().file_index,
                timestamp_ms: b.timestamp_ms(),
                detections: b.detections().to_vec(),
            })
            .collect();

        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            emitted_at: Utc::now(),
            source_id: path.last().frame().source_id.clone(),
            track_id: path.track_id(),
            label: path.label().map(str::to_string),
            first_frame: path.first_frame(),
            last_frame: path.last_frame(),
            bundles,
            snapshot_base64: None,
        }
    }

    /// Attach a JPEG crop of the best bundle's representative box.
    pub fn with_snapshot(mut self, path: &ItemPath, quality: u8) -> Result<Self> {
        let best = path
            .bundles()
            .iter()
            .max_by(|a, b| {
                a.max_confidence()
                    .partial_cmp(&b.max_confidence())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| anyhow!("empty path"))?;
        let region = best
            .representative_box()
            .ok_or_else(|| anyhow!("bundle without detections"))?;

        let image = &best.frame().image;
        if image.width() == 0 || image.height() == 0 {
            bail!("empty frame F{}", best.frame_index());
        }
        let x = (region.x1.max(0.0) as u32).min(image.width().saturating_sub(1));
        let y = (region.y1.max(0.0) as u32).min(image.height().saturating_sub(1));
        let w = (region.width() as u32).clamp(1, image.width() - x);
        let h = (region.height() as u32).clamp(1, image.height() - y);

        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let jpeg = encode_jpeg(&crop, quality)?;
        self.snapshot_base64 = Some(base64::engine::general_purpose::STANDARD.encode(jpeg));
        Ok(self)
    }
}

pub trait TraceSink: Send {
    fn name(&self) -> &str;

    fn submit(&mut self, record: &TraceRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// JSONL
// ============================================================================

pub struct JsonlSink {
    writer: BufWriter<File>,
    written: u64,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        info!("📝 Writing traces to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl TraceSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn submit(&mut self, record: &TraceRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize trace")?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Delivery counters shared with the uploader task.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub delivered: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
}

impl DeliveryStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct HttpSink {
    tx: mpsc::Sender<TraceRecord>,
    stats: DeliveryStats,
}

/// Owned by the runtime; await `join` after the sink is dropped to let the
/// queue drain.
pub struct HttpSinkHandle {
    pub join: tokio::task::JoinHandle<()>,
    pub stats: DeliveryStats,
}

impl HttpSink {
    pub fn spawn(
        url: String,
        timeout_secs: u64,
        queue_size: usize,
        runtime: &tokio::runtime::Handle,
    ) -> Result<(Self, HttpSinkHandle)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let (tx, mut rx) = mpsc::channel::<TraceRecord>(queue_size.max(1));
        let stats = DeliveryStats::default();
        let task_stats = stats.clone();

        info!("🌐 Uploading traces to {}", url);
        let join = runtime.spawn(async move {
            while let Some(record) = rx.recv().await {
                match client.post(&url).json(&record).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        task_stats.delivered.fetch_add(1, Ordering::Relaxed);
                        debug!("🌐 Delivered trace {}", record.event_id);
                    }
                    Ok(resp) => {
                        task_stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!("🌐 Trace {} rejected: {}", record.event_id, resp.status());
                    }
                    Err(e) => {
                        task_stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!("🌐 Trace {} upload failed: {}", record.event_id, e);
                    }
                }
            }
            debug!("🌐 Upload queue closed");
        });

        Ok((
            Self {
                tx,
                stats: stats.clone(),
            },
            HttpSinkHandle { join, stats },
        ))
    }
}

impl TraceSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    fn submit(&mut self, record: &TraceRecord) -> Result<()> {
        self.tx.try_send(record.clone()).map_err(|e| {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("🌐 Upload queue full, dropping trace {}", record.event_id);
                    anyhow!("upload queue full")
                }
                mpsc::error::TrySendError::Closed(_) => anyhow!("upload task stopped"),
            }
        })
    }
}
