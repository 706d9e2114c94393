// src/pipeline/sequencer.rs
//
// Runs the stage chain once per frame.
//
// Per frame:
//   1. reject frames whose index is not strictly increasing
//   2. push the frame into the frame history
//   3. run every stage in order on a fresh detection list; stage i gets
//      StageId(i) and the id of stage i-1 so it can pick out exactly the
//      detections it should act on
//   4. hand every path emitted this cycle to the sinks
//
// Stages may only append. A stage that errors is logged and recorded as not
// contributing; the frame and the run carry on.

use super::event_bus::{EventBus, PipelineEvent};
use super::frame_context::{CycleContext, LaneDelta, RunState};
use super::metrics::{MetricsSummary, PipelineMetrics};
use crate::detection::{DetectionBundle, ItemPath, StageId};
use crate::frame_buffer::FrameHistory;
use crate::trace_sink::{TraceRecord, TraceSink};
use crate::types::{Frame, SharedFrame};
use crate::video_processor::FrameSource;
use anyhow::{ensure, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Examine the frame, append to `bundles`, report whether anything was
    /// contributed. `previous` is the stage that ran just before this one.
    fn run(
        &mut self,
        ctx: &mut CycleContext<'_>,
        frame: &SharedFrame,
        bundles: &mut Vec<DetectionBundle>,
        previous: Option<StageId>,
    ) -> Result<bool>;
}

/// Everything one frame produced.
#[derive(Debug)]
pub struct FrameResult {
    pub frame_index: u64,
    pub bundles: Vec<DetectionBundle>,
    pub paths: Vec<ItemPath>,
    pub lane_deltas: Vec<LaneDelta>,
    /// (stage name, contributed) in run order
    pub contributions: Vec<(&'static str, bool)>,
}

impl FrameResult {
    pub fn contributed(&self, stage: &str) -> bool {
        self.contributions
            .iter()
            .any(|(name, c)| *name == stage && *c)
    }
}

pub struct StageSequencer {
    stages: Vec<Box<dyn Stage>>,
    history: FrameHistory,
    bus: EventBus,
    metrics: PipelineMetrics,
    run_state: RunState,
    sinks: Vec<Box<dyn TraceSink>>,
    snapshot_quality: Option<u8>,
    last_index: Option<u64>,
}

impl StageSequencer {
    pub fn new(stages: Vec<Box<dyn Stage>>, history: FrameHistory) -> Result<Self> {
        ensure!(!stages.is_empty(), "stage list must not be empty");
        ensure!(
            stages.len() < StageId::UNASSIGNED.index(),
            "too many stages ({})",
            stages.len()
        );
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        info!(
            "⛓️  Sequencer: {} (history {} frames)",
            names.join(" → "),
            history.capacity()
        );
        Ok(Self {
            stages,
            history,
            bus: EventBus::new(256),
            metrics: PipelineMetrics::new(),
            run_state: RunState::new(),
            sinks: Vec::new(),
            snapshot_quality: None,
            last_index: None,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach a JPEG crop to every emitted trace.
    pub fn with_snapshots(mut self, quality: u8) -> Self {
        self.snapshot_quality = Some(quality);
        self
    }

    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        self.bus.drain()
    }

    /// Run all stages on one frame. `None` when the frame was rejected.
    pub fn process_frame(&mut self, frame: Frame) -> Option<FrameResult> {
        if let Some(last) = self.last_index {
            if frame.index <= last {
                warn!(
                    "⚠️  Dropping F{}: not after F{} (frames must be strictly increasing)",
                    frame.index, last
                );
                self.metrics.inc(&self.metrics.dropped_frames);
                return None;
            }
        }
        self.last_index = Some(frame.index);

        let started = Instant::now();
        let frame = frame.into_shared();
        self.history.push(frame.clone());
        self.metrics.inc(&self.metrics.total_frames);

        let mut bundles: Vec<DetectionBundle> = Vec::new();
        let mut contributions = Vec::with_capacity(self.stages.len());

        let mut ctx = CycleContext::new(
            frame.index,
            &self.history,
            &mut self.bus,
            &self.metrics,
            &mut self.run_state,
        );

        for (i, stage) in self.stages.iter_mut().enumerate() {
            let id = StageId(i as u16);
            let previous = i.checked_sub(1).map(|p| StageId(p as u16));
            ctx.stage = id;

            let before = detection_count(&bundles);
            let contributed = match stage.run(&mut ctx, &frame, &mut bundles, previous) {
                Ok(c) => c,
                Err(e) => {
                    error!("❌ F{} stage {} ({}) failed: {:#}", frame.index, id, stage.name(), e);
                    ctx.metrics.inc(&ctx.metrics.stage_errors);
                    false
                }
            };
            let after = detection_count(&bundles);
            if after < before {
                error!(
                    "❌ F{} stage {} ({}) removed detections ({} → {})",
                    frame.index,
                    id,
                    stage.name(),
                    before,
                    after
                );
                ctx.metrics.inc(&ctx.metrics.stage_errors);
            }

            debug!(
                "   F{} {} {}: {}",
                frame.index,
                id,
                stage.name(),
                if contributed { "contributed" } else { "-" }
            );
            contributions.push((stage.name(), contributed));
        }

        let paths = std::mem::take(&mut ctx.paths);
        let lane_deltas = std::mem::take(&mut ctx.lane_deltas);
        drop(ctx);

        for path in &paths {
            self.submit(path);
        }

        let elapsed_us = started.elapsed().as_micros() as u64;
        self.metrics.record_frame_time(elapsed_us);

        Some(FrameResult {
            frame_index: frame.index,
            bundles,
            paths,
            lane_deltas,
            contributions,
        })
    }

    fn submit(&mut self, path: &ItemPath) {
        if self.sinks.is_empty() {
            return;
        }
        let mut record = TraceRecord::from_path(path);
        if let Some(quality) = self.snapshot_quality {
            match record.clone().with_snapshot(path, quality) {
                Ok(with) => record = with,
                Err(e) => warn!("⚠️  Snapshot for {} failed: {:#}", record.event_id, e),
            }
        }
        for sink in self.sinks.iter_mut() {
            match sink.submit(&record) {
                Ok(()) => self.metrics.inc(&self.metrics.sink_successes),
                Err(e) => {
                    warn!("⚠️  Sink {} rejected {}: {:#}", sink.name(), record.event_id, e);
                    self.metrics.inc(&self.metrics.sink_failures);
                }
            }
        }
    }

    /// Pull frames until the source ends or `cancel` is set. Cancellation is
    /// checked between frames only.
    pub fn run(&mut self, source: &mut dyn FrameSource, cancel: &AtomicBool) -> Result<MetricsSummary> {
        loop {
            if cancel.load(Ordering::Relaxed) {
                info!("🛑 Cancelled after F{}", self.last_index.unwrap_or(0));
                break;
            }
            let Some(frame) = source.next_frame().context("Frame source failed")? else {
                info!("🏁 End of stream");
                break;
            };
            let index = frame.index;
            self.process_frame(frame);
            for event in self.bus.drain() {
                event.log();
            }
            if index % 100 == 0 {
                debug!("📊 F{}: {:.1} fps", index, self.metrics.fps());
            }
        }

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                warn!("⚠️  Sink {} flush failed: {:#}", sink.name(), e);
            }
        }
        Ok(self.metrics.summary())
    }
}

fn detection_count(bundles: &[DetectionBundle]) -> usize {
    bundles.iter().map(|b| b.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, Provenance};
    use crate::geometry::BBox;
    use anyhow::bail;
    use image::RgbImage;
    use std::sync::{Arc, Mutex};

    /// Appends one detection per frame and records the `previous` it saw.
    struct EmitStage {
        seen: Arc<Mutex<Vec<(StageId, Option<StageId>)>>>,
    }

    impl Stage for EmitStage {
        fn name(&self) -> &'static str {
            "emit"
        }

        fn run(
            &mut self,
            ctx: &mut CycleContext<'_>,
            frame: &SharedFrame,
            bundles: &mut Vec<DetectionBundle>,
            previous: Option<StageId>,
        ) -> Result<bool> {
            self.seen.lock().unwrap().push((ctx.stage, previous));
            let det = Detection::new("car", 0.9, BBox::new(0.0, 0.0, 1.0, 1.0))
                .stamped(ctx.stage, Provenance::Cheap);
            bundles.push(DetectionBundle::new(frame.clone(), det));
            Ok(true)
        }
    }

    struct FailStage;

    impl Stage for FailStage {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn run(
            &mut self,
            _ctx: &mut CycleContext<'_>,
            _frame: &SharedFrame,
            _bundles: &mut Vec<DetectionBundle>,
            _previous: Option<StageId>,
        ) -> Result<bool> {
            bail!("boom")
        }
    }

    struct VecSource(std::vec::IntoIter<Frame>);

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Ok(self.0.next())
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(index, RgbImage::new(2, 2))
    }

    fn emit() -> (Box<dyn Stage>, Arc<Mutex<Vec<(StageId, Option<StageId>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Box::new(EmitStage { seen: seen.clone() }), seen)
    }

    #[test]
    fn test_empty_stage_list_rejected() {
        assert!(StageSequencer::new(Vec::new(), FrameHistory::new(4).unwrap()).is_err());
    }

    #[test]
    fn test_stages_see_previous_stage_id() {
        let (a, seen_a) = emit();
        let (b, seen_b) = emit();
        let mut seq = StageSequencer::new(vec![a, b], FrameHistory::new(4).unwrap()).unwrap();

        let result = seq.process_frame(frame(1)).unwrap();

        assert_eq!(*seen_a.lock().unwrap(), vec![(StageId(0), None)]);
        assert_eq!(*seen_b.lock().unwrap(), vec![(StageId(1), Some(StageId(0)))]);
        assert_eq!(result.bundles.len(), 2);
        assert_eq!(result.bundles[0].detections()[0].stage, StageId(0));
        assert_eq!(result.bundles[1].detections()[0].stage, StageId(1));
    }

    #[test]
    fn test_stage_error_is_isolated() {
        let (a, _) = emit();
        let (c, seen_c) = emit();
        let mut seq =
            StageSequencer::new(vec![a, Box::new(FailStage), c], FrameHistory::new(4).unwrap()).unwrap();

        let result = seq.process_frame(frame(1)).unwrap();

        assert_eq!(
            result.contributions,
            vec![("emit", true), ("fail", false), ("emit", true)]
        );
        assert_eq!(seen_c.lock().unwrap().len(), 1);
        assert_eq!(seq.metrics().get(&seq.metrics().stage_errors), 1);
    }

    #[test]
    fn test_out_of_order_frames_dropped() {
        let (a, _) = emit();
        let mut seq = StageSequencer::new(vec![a], FrameHistory::new(4).unwrap()).unwrap();
        assert!(seq.process_frame(frame(5)).is_some());
        assert!(seq.process_frame(frame(5)).is_none());
        assert!(seq.process_frame(frame(3)).is_none());
        assert!(seq.process_frame(frame(6)).is_some());
        assert_eq!(seq.history().len(), 2);
        assert_eq!(seq.metrics().get(&seq.metrics().dropped_frames), 2);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let run = || {
            let (a, _) = emit();
            let mut seq = StageSequencer::new(vec![a], FrameHistory::new(4).unwrap()).unwrap();
            seq.process_frame(frame(1)).unwrap().bundles[0].detections().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_run_stops_on_cancel_and_end_of_stream() {
        let (a, _) = emit();
        let mut seq = StageSequencer::new(vec![a], FrameHistory::new(4).unwrap()).unwrap();
        let mut source = VecSource(vec![frame(1), frame(2), frame(3)].into_iter());

        let summary = seq.run(&mut source, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.total_frames, 3);

        let cancelled = AtomicBool::new(true);
        let mut more = VecSource(vec![frame(4)].into_iter());
        let summary = seq.run(&mut more, &cancelled).unwrap();
        assert_eq!(summary.total_frames, 3);
    }
}
