// src/analysis/mod.rs
//
// Escalation and tracking state machines.
//
// Signal flow:
//   lane count → edge_trigger → (edge) → cascade ─ cheap walk over FrameHistory
//                                              └─ heavy re-check of weak boxes
//   terminal bundle → path_tracker (predictors over BundleHistory) → ItemPath
//
// Driven per frame by the stages in pipeline::stages.

pub mod cascade;
pub mod edge_trigger;
pub mod path_tracker;
pub mod predictors;

// Re-exports for ergonomic access from the pipeline
pub use cascade::{
    CascadeConfig, CascadeStats, EscalationController, EscalationOutcome, HeavyEscalation, LaneState,
};
pub use edge_trigger::{Edge, EdgeTrigger, EdgeTriggerConfig, TriggerState};
pub use path_tracker::{PathTracker, PathTrackerConfig, PredictorKind};
pub use predictors::{Candidate, Direction, OverlapPredictor, PolynomialPredictor, Predictor, SearchParams};
