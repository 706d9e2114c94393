// src/analysis/cascade.rs
//
// Escalation cascade. A lane count change starts a backward walk over the
// frame history looking for the frame where the object first touched the
// line; only the cheap detector runs during the walk. Detections the cheap
// tier is unsure about are re-examined by the heavy tier on the same frame
// and region.
//
// Per-lane state: Idle → CheapInvoked → Resolved | Idle
//                 HeavyInvoked while a low-confidence region is re-checked
//
// Walk order:
//   offset 0 is the newest frame in the history (the frame whose count
//   changed), then 1, 2, ... up to `search_range - 1`. The first frame with
//   a qualifying detection wins and the walk stops there.
//
// Detector errors never abort anything: the frame is treated as empty and
// the walk moves on.

use crate::detection::{merge_detection, Detection, DetectionBundle, Provenance, StageId, TriggerLine};
use crate::frame_buffer::FrameHistory;
use crate::geometry::{iou, segment_box_overlap};
use crate::inference::{DetectRequest, Detector};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Frames walked backward from the count change
    pub search_range: usize,
    /// Floor for a cheap detection to be kept at all
    pub cheap_min_confidence: f32,
    /// Cheap detections below this ask the heavy tier for a second look
    pub escalation_confidence: f32,
    /// Floor for a heavy detection to be kept
    pub heavy_min_confidence: f32,
    /// Accepted labels; empty accepts everything
    pub categories: Vec<String>,
    /// Minimum fraction of the trigger line covered by the box
    pub min_line_overlap: f32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            search_range: 5,
            cheap_min_confidence: 0.3,
            escalation_confidence: 0.6,
            heavy_min_confidence: 0.5,
            categories: vec![
                "car".to_string(),
                "truck".to_string(),
                "bus".to_string(),
                "motorcycle".to_string(),
                "bicycle".to_string(),
                "person".to_string(),
            ],
            min_line_overlap: 0.05,
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.search_range > 0, "cascade.search_range must be > 0");
        for (name, v) in [
            ("cheap_min_confidence", self.cheap_min_confidence),
            ("escalation_confidence", self.escalation_confidence),
            ("heavy_min_confidence", self.heavy_min_confidence),
            ("min_line_overlap", self.min_line_overlap),
        ] {
            ensure!(
                (0.0..=1.0).contains(&v),
                "cascade.{} must be in [0, 1] (got {})",
                name,
                v
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LaneState {
    #[default]
    Idle,
    CheapInvoked,
    HeavyInvoked,
    Resolved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    /// Count did not change
    NoChange,
    /// History shorter than the search range; no detector was called
    InsufficientHistory { available: usize, required: usize },
    /// Cheap tier found the origin frame
    Resolved {
        frame_index: u64,
        offset: usize,
        merged: usize,
    },
    /// Walked the full range without a qualifying detection
    Exhausted { searched: usize },
}

/// One heavy re-check of a low-confidence region.
#[derive(Debug, Clone)]
pub struct HeavyEscalation {
    pub frame_index: u64,
    pub lane: Option<String>,
    pub label: String,
    pub cheap_confidence: f32,
    /// Confidence of the heavy detection that was merged, if any
    pub heavy_confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub cheap_calls: u64,
    pub heavy_calls: u64,
    pub detector_failures: u64,
}

pub struct EscalationController {
    config: CascadeConfig,
    cheap: Box<dyn Detector>,
    heavy: Box<dyn Detector>,
    lanes: HashMap<String, LaneState>,
    stats: CascadeStats,
}

impl EscalationController {
    pub fn new(config: CascadeConfig, cheap: Box<dyn Detector>, heavy: Box<dyn Detector>) -> Result<Self> {
        config.validate()?;
        info!(
            "🪜 Cascade: cheap='{}' heavy='{}' range={} escalate<{:.2}",
            cheap.name(),
            heavy.name(),
            config.search_range,
            config.escalation_confidence
        );
        Ok(Self {
            config,
            cheap,
            heavy,
            lanes: HashMap::new(),
            stats: CascadeStats::default(),
        })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn lane_state(&self, lane: &str) -> LaneState {
        self.lanes.get(lane).copied().unwrap_or_default()
    }

    pub fn stats(&self) -> CascadeStats {
        self.stats
    }

    /// Return the counters accumulated since the last call and reset them.
    pub fn take_stats(&mut self) -> CascadeStats {
        std::mem::take(&mut self.stats)
    }

    fn set_state(&mut self, lane: &str, state: LaneState) {
        self.lanes.insert(lane.to_string(), state);
    }

    /// React to a count change on one lane. Qualifying cheap detections are
    /// merged into `bundles`, anchored to the frame they were found on.
    pub fn on_count_delta(
        &mut self,
        lane: &TriggerLine,
        previous: u32,
        current: u32,
        history: &FrameHistory,
        bundles: &mut Vec<DetectionBundle>,
        stage: StageId,
    ) -> EscalationOutcome {
        self.set_state(&lane.name, LaneState::Idle);

        if previous == current {
            return EscalationOutcome::NoChange;
        }

        let required = self.config.search_range;
        if history.len() < required {
            debug!(
                "⏳ {}: {} frames in history, need {} - skipping search",
                lane.name,
                history.len(),
                required
            );
            return EscalationOutcome::InsufficientHistory {
                available: history.len(),
                required,
            };
        }

        info!(
            "🔎 {}: count {} → {}, walking back {} frames",
            lane.name, previous, current, required
        );
        self.set_state(&lane.name, LaneState::CheapInvoked);

        let request = DetectRequest {
            categories: self.config.categories.clone(),
            trigger_line: Some(lane.segment),
            min_overlap: Some(self.config.min_line_overlap),
            region: None,
        };

        for (offset, frame) in history.iter_recent().take(required).enumerate() {
            self.stats.cheap_calls += 1;
            let raw = match self.cheap.detect(frame, &request) {
                Ok(found) => found,
                Err(e) => {
                    self.stats.detector_failures += 1;
                    warn!("⚠️  {}: cheap detector failed on F{}: {:#}", lane.name, frame.index, e);
                    continue;
                }
            };

            let qualifying: Vec<Detection> = raw
                .into_iter()
                .filter(|d| self.qualifies_cheap(d, lane, &request))
                .collect();

            if qualifying.is_empty() {
                debug!("   offset {} (F{}): nothing on the line", offset, frame.index);
                continue;
            }

            let merged = qualifying.len();
            for det in qualifying {
                let escalate = det.confidence < self.config.escalation_confidence;
                let det = det
                    .stamped(stage, Provenance::Cheap)
                    .with_trigger_line(Some(lane.clone()))
                    .with_escalation(escalate);
                merge_detection(bundles, frame, det);
            }

            info!(
                "✅ {}: origin at F{} (offset {}), {} detection(s)",
                lane.name, frame.index, offset, merged
            );
            self.set_state(&lane.name, LaneState::Resolved);
            return EscalationOutcome::Resolved {
                frame_index: frame.index,
                offset,
                merged,
            };
        }

        info!("🚫 {}: no origin within {} frames", lane.name, required);
        self.set_state(&lane.name, LaneState::Idle);
        EscalationOutcome::Exhausted { searched: required }
    }

    fn qualifies_cheap(&self, det: &Detection, lane: &TriggerLine, request: &DetectRequest) -> bool {
        if det.confidence < self.config.cheap_min_confidence || !request.accepts_label(&det.label) {
            return false;
        }
        let overlap = segment_box_overlap(&lane.segment, &det.bbox);
        overlap > 0.0 && overlap >= self.config.min_line_overlap
    }

    /// Re-run every pending low-confidence detection through the heavy tier
    /// on the frame and region that produced it. The first qualifying heavy
    /// detection is appended to the same bundle. The trigger is consumed
    /// whether or not the heavy tier found anything.
    pub fn escalate_low_confidence(
        &mut self,
        bundles: &mut [DetectionBundle],
        stage: StageId,
    ) -> Vec<HeavyEscalation> {
        let mut report = Vec::new();

        for bundle in bundles.iter_mut() {
            for idx in bundle.pending_escalations() {
                let Some(source) = bundle.detections().get(idx).cloned() else {
                    continue;
                };
                let frame = bundle.frame().clone();
                let lane = source.trigger_name().map(str::to_string);
                if let Some(name) = &lane {
                    self.set_state(name, LaneState::HeavyInvoked);
                }

                let request = DetectRequest {
                    categories: self.config.categories.clone(),
                    trigger_line: source.trigger_line.as_ref().map(|l| l.segment),
                    min_overlap: None,
                    region: Some(source.bbox),
                };

                self.stats.heavy_calls += 1;
                let found = match self.heavy.detect(&frame, &request) {
                    Ok(found) => found,
                    Err(e) => {
                        self.stats.detector_failures += 1;
                        warn!("⚠️  heavy detector failed on F{}: {:#}", frame.index, e);
                        Vec::new()
                    }
                };

                // First qualifying wins.
                let hit = found.into_iter().find(|d| {
                    d.confidence >= self.config.heavy_min_confidence
                        && request.accepts_label(&d.label)
                        && iou(&source.bbox, &d.bbox) > 0.0
                });

                bundle.consume_trigger(idx);

                let heavy_confidence = hit.as_ref().map(|d| d.confidence);
                if let Some(det) = hit {
                    info!(
                        "🧠 F{}: heavy confirmed {} {:.2} → {} {:.2}",
                        frame.index, source.label, source.confidence, det.label, det.confidence
                    );
                    bundle.push(
                        det.stamped(stage, Provenance::Heavy)
                            .with_trigger_line(source.trigger_line.clone()),
                    );
                } else {
                    debug!(
                        "🧠 F{}: heavy found nothing for {} {:.2}",
                        frame.index, source.label, source.confidence
                    );
                }
                if let Some(name) = &lane {
                    let state = if heavy_confidence.is_some() {
                        LaneState::Resolved
                    } else {
                        LaneState::Idle
                    };
                    self.set_state(name, state);
                }

                report.push(HeavyEscalation {
                    frame_index: frame.index,
                    lane,
                    label: source.label.clone(),
                    cheap_confidence: source.confidence,
                    heavy_confidence,
                });
            }
        }

        report
    }
}
