// src/pipeline/stages.rs
//
// Built-in stage chain:
//
//   LineCrossingStage → CascadeStage → TrackingStage
//
//   LineCrossingStage  counts objects on each trigger line from the
//                      foreground mask and debounces the count into edges
//   CascadeStage       turns every edge into a backward cheap-detector walk,
//                      then sends weak detections to the heavy tier
//   TrackingStage      stitches every terminal bundle into a path and
//                      assigns its track id

use super::event_bus::PipelineEvent;
use super::frame_context::{CycleContext, LaneDelta};
use super::sequencer::Stage;
use crate::analysis::{
    EdgeTrigger, EdgeTriggerConfig, EscalationController, EscalationOutcome, PathTracker,
};
use crate::detection::{DetectionBundle, StageId, TriggerLine};
use crate::frame_buffer::BundleHistory;
use crate::geometry::Segment;
use crate::inference::Detector;
use crate::types::{Config, Frame, SharedFrame};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// LINE CROSSING
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub name: String,
    pub line: Segment,
    #[serde(flatten)]
    pub trigger: EdgeTriggerConfig,
    /// Mask value at or above which a pixel counts as foreground
    pub mask_threshold: u8,
    /// Points sampled along the line
    pub samples: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            line: Segment::new([0.0, 0.0], [0.0, 0.0]),
            trigger: EdgeTriggerConfig::default(),
            mask_threshold: 128,
            samples: 64,
        }
    }
}

impl LaneConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.trim().is_empty(), "lane name must not be empty");
        ensure!(
            !self.line.is_degenerate(),
            "lane '{}': line endpoints must be finite and distinct",
            self.name
        );
        ensure!(self.samples >= 2, "lane '{}': samples must be >= 2", self.name);
        self.trigger.validate()
    }
}

struct LaneMonitor {
    line: TriggerLine,
    trigger: EdgeTrigger,
    mask_threshold: u8,
    samples: usize,
    /// Count at the last edge
    stable_count: u32,
}

/// Number of separate foreground runs crossing `line`. A frame without a
/// mask has nothing on any line.
pub fn count_on_line(frame: &Frame, line: &Segment, samples: usize, threshold: u8) -> u32 {
    let Some(mask) = frame.foreground.as_ref() else {
        return 0;
    };
    let (w, h) = mask.dimensions();
    let steps = samples.max(2);

    let mut runs = 0u32;
    let mut inside = false;
    for i in 0..steps {
        let t = i as f32 / (steps - 1) as f32;
        let (x, y) = line.point_at(t);
        let (px, py) = (x.round(), y.round());
        let occupied = px >= 0.0
            && py >= 0.0
            && (px as u32) < w
            && (py as u32) < h
            && mask.get_pixel(px as u32, py as u32).0[0] >= threshold;
        if occupied && !inside {
            runs += 1;
        }
        inside = occupied;
    }
    runs
}

pub struct LineCrossingStage {
    lanes: Vec<LaneMonitor>,
}

impl LineCrossingStage {
    pub fn new(lanes: &[LaneConfig]) -> Result<Self> {
        let mut monitors = Vec::with_capacity(lanes.len());
        for lane in lanes {
            lane.validate()?;
            monitors.push(LaneMonitor {
                line: TriggerLine::new(lane.name.clone(), lane.line),
                trigger: EdgeTrigger::new(lane.trigger.clone())?,
                mask_threshold: lane.mask_threshold,
                samples: lane.samples,
                stable_count: 0,
            });
        }
        info!("📏 Monitoring {} line(s)", monitors.len());
        Ok(Self { lanes: monitors })
    }
}

impl Stage for LineCrossingStage {
    fn name(&self) -> &'static str {
        "line_crossing"
    }

    fn run(
        &mut self,
        ctx: &mut CycleContext<'_>,
        frame: &SharedFrame,
        _bundles: &mut Vec<DetectionBundle>,
        _previous: Option<StageId>,
    ) -> Result<bool> {
        let mut fired = false;
        for lane in &mut self.lanes {
            let count = count_on_line(frame, &lane.line.segment, lane.samples, lane.mask_threshold);
            let Some(edge) = lane.trigger.update(count as f32) else {
                continue;
            };

            let delta = LaneDelta {
                lane: lane.line.clone(),
                previous: lane.stable_count,
                current: count,
                edge,
            };
            lane.stable_count = count;

            ctx.metrics.inc(&ctx.metrics.lane_edges);
            ctx.events.publish(PipelineEvent::LaneEdge {
                frame_index: frame.index,
                lane: delta.lane.name.clone(),
                edge,
                previous: delta.previous,
                current: delta.current,
            });
            ctx.lane_deltas.push(delta);
            fired = true;
        }
        Ok(fired)
    }
}

// ============================================================================
// CASCADE
// ============================================================================

pub struct CascadeStage {
    controller: EscalationController,
}

impl CascadeStage {
    pub fn new(controller: EscalationController) -> Self {
        Self { controller }
    }
}

impl Stage for CascadeStage {
    fn name(&self) -> &'static str {
        "cascade"
    }

    fn run(
        &mut self,
        ctx: &mut CycleContext<'_>,
        _frame: &SharedFrame,
        bundles: &mut Vec<DetectionBundle>,
        _previous: Option<StageId>,
    ) -> Result<bool> {
        let before: usize = bundles.iter().map(|b| b.len()).sum();
        let deltas = ctx.lane_deltas.clone();

        for delta in &deltas {
            let outcome = self.controller.on_count_delta(
                &delta.lane,
                delta.previous,
                delta.current,
                ctx.history,
                bundles,
                ctx.stage,
            );
            let lane = delta.lane.name.clone();
            match outcome {
                EscalationOutcome::NoChange => {}
                EscalationOutcome::InsufficientHistory { available, required } => {
                    ctx.events.publish(PipelineEvent::EscalationSkipped {
                        lane,
                        reason: format!("history {}/{} frames", available, required),
                    });
                }
                EscalationOutcome::Exhausted { searched } => {
                    ctx.events.publish(PipelineEvent::EscalationSkipped {
                        lane,
                        reason: format!("nothing found in {} frames", searched),
                    });
                }
                EscalationOutcome::Resolved {
                    frame_index,
                    offset,
                    merged,
                } => {
                    ctx.events.publish(PipelineEvent::CheapResolved {
                        lane,
                        origin_frame: frame_index,
                        offset,
                        merged,
                    });
                }
            }
        }

        let escalations = self.controller.escalate_low_confidence(bundles, ctx.stage);
        ctx.metrics
            .add(&ctx.metrics.escalations, escalations.len() as u64);
        for e in escalations {
            ctx.events.publish(PipelineEvent::HeavyEscalated {
                frame_index: e.frame_index,
                lane: e.lane,
                label: e.label,
                cheap_confidence: e.cheap_confidence,
                heavy_confidence: e.heavy_confidence,
            });
        }

        let stats = self.controller.take_stats();
        ctx.metrics.add(&ctx.metrics.cheap_calls, stats.cheap_calls);
        ctx.metrics.add(&ctx.metrics.heavy_calls, stats.heavy_calls);
        ctx.metrics
            .add(&ctx.metrics.detector_failures, stats.detector_failures);

        let added = bundles
            .iter()
            .map(|b| b.len())
            .sum::<usize>()
            .saturating_sub(before);
        ctx.metrics
            .add(&ctx.metrics.detections_merged, added as u64);
        Ok(added > 0)
    }
}

// ============================================================================
// TRACKING
// ============================================================================

pub struct TrackingStage {
    tracker: PathTracker,
    bundle_history: BundleHistory,
}

impl TrackingStage {
    pub fn new(tracker: PathTracker, bundle_history: BundleHistory) -> Self {
        Self {
            tracker,
            bundle_history,
        }
    }
}

impl Stage for TrackingStage {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn run(
        &mut self,
        ctx: &mut CycleContext<'_>,
        _frame: &SharedFrame,
        bundles: &mut Vec<DetectionBundle>,
        previous: Option<StageId>,
    ) -> Result<bool> {
        let Some(previous) = previous else {
            return Ok(false);
        };

        let mut emitted = false;
        for bundle in bundles.iter_mut() {
            if !bundle.has_detection_from(previous) || bundle.has_pending_escalation() {
                continue;
            }

            // A later edge can walk back onto a frame that was already
            // finalized; keep the earlier identity and emit nothing new.
            let finalized_twin = bundle.representative_box().and_then(|bbox| {
                self.bundle_history
                    .find_overlapping(bundle.frame_index(), &bbox)
                    .and_then(|b| b.track_id())
            });
            if let Some(track_id) = finalized_twin {
                debug!(
                    "🧵 F{}: bundle at F{} already on track #{}, not re-emitted",
                    ctx.frame_index,
                    bundle.frame_index(),
                    track_id
                );
                bundle.assign_track_id(track_id);
                continue;
            }

            let seed = Arc::new(bundle.clone());
            let mut path = self.tracker.track(seed.clone(), &self.bundle_history);

            let track_id = match path.track_id() {
                Some(id) => id,
                None => ctx.run.allocate_track_id(),
            };
            bundle.assign_track_id(track_id);

            let finalized = Arc::new(bundle.clone());
            path.replace(&seed, finalized.clone());
            self.bundle_history.push(finalized);

            debug!(
                "🧵 F{}: bundle at F{} → track #{} ({} bundles)",
                ctx.frame_index,
                bundle.frame_index(),
                track_id,
                path.len()
            );
            ctx.metrics.inc(&ctx.metrics.paths_emitted);
            ctx.events.publish(PipelineEvent::PathEmitted {
                track_id,
                label: path.label().unwrap_or("unknown").to_string(),
                first_frame: path.first_frame(),
                last_frame: path.last_frame(),
                length: path.len(),
            });
            ctx.paths.push(path);
            emitted = true;
        }
        Ok(emitted)
    }
}

// ============================================================================
// CHAIN
// ============================================================================

/// The standard chain for a configured run.
pub fn build_chain(
    config: &Config,
    cheap: Box<dyn Detector>,
    heavy: Box<dyn Detector>,
) -> Result<Vec<Box<dyn Stage>>> {
    let controller = EscalationController::new(config.cascade.clone(), cheap, heavy)?;
    let tracker = PathTracker::new(&config.tracker)?;
    let bundle_history = BundleHistory::new(config.history.bundle_window)?;
    Ok(vec![
        Box::new(LineCrossingStage::new(&config.lanes)?),
        Box::new(CascadeStage::new(controller)),
        Box::new(TrackingStage::new(tracker, bundle_history)),
    ])
}
