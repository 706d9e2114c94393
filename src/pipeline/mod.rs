// src/pipeline/mod.rs

pub mod event_bus;
pub mod frame_context;
pub mod metrics;
pub mod sequencer;
pub mod stages;

pub use event_bus::{EventBus, PipelineEvent};
pub use frame_context::{CycleContext, LaneDelta, RunState};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use sequencer::{FrameResult, Stage, StageSequencer};
pub use stages::{build_chain, CascadeStage, LaneConfig, LineCrossingStage, TrackingStage};
