// src/pipeline/frame_context.rs
//
// Per-cycle state handed to every stage. Stages talk to each other through
// this context (lane deltas, emitted paths) instead of holding references
// to one another.

use super::event_bus::EventBus;
use super::metrics::PipelineMetrics;
use crate::analysis::Edge;
use crate::detection::{ItemPath, StageId, TriggerLine};
use crate::frame_buffer::FrameHistory;

/// A debounced count change on one lane during this cycle.
#[derive(Debug, Clone)]
pub struct LaneDelta {
    pub lane: TriggerLine,
    /// Stable count at the previous edge
    pub previous: u32,
    pub current: u32,
    pub edge: Edge,
}

/// State that outlives a single frame but belongs to one pipeline run.
#[derive(Debug, Default)]
pub struct RunState {
    next_track_id: u64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_track_id(&mut self) -> u64 {
        self.next_track_id += 1;
        self.next_track_id
    }
}

pub struct CycleContext<'a> {
    pub frame_index: u64,
    /// Identity of the stage currently running
    pub stage: StageId,
    pub history: &'a FrameHistory,
    pub lane_deltas: Vec<LaneDelta>,
    pub paths: Vec<ItemPath>,
    pub events: &'a mut EventBus,
    pub metrics: &'a PipelineMetrics,
    pub run: &'a mut RunState,
}

impl<'a> CycleContext<'a> {
    pub fn new(
        frame_index: u64,
        history: &'a FrameHistory,
        events: &'a mut EventBus,
        metrics: &'a PipelineMetrics,
        run: &'a mut RunState,
    ) -> Self {
        Self {
            frame_index,
            stage: StageId::UNASSIGNED,
            history,
            lane_deltas: Vec::new(),
            paths: Vec::new(),
            events,
            metrics,
            run,
        }
    }
}
