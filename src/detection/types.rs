// src/detection/types.rs
//
// Value types for a single detected region. A Detection is created by one
// detector invocation and is frozen once it is attached to a bundle, except
// for the escalation trigger flag and the downstream-assigned track id.

use crate::geometry::{BBox, Segment};
use serde::{Deserialize, Serialize};

/// Handle of the stage that produced a detection. Assigned by the sequencer
/// from the stage's position in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u16);

impl StageId {
    /// Detections straight out of a detector, before a stage stamps them.
    pub const UNASSIGNED: StageId = StageId(u16::MAX);

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::UNASSIGNED {
            write!(f, "S?")
        } else {
            write!(f, "S{}", self.0)
        }
    }
}

/// Which detector tier produced the detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Unassigned,
    Cheap,
    Heavy,
    Cloud,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Cheap => "cheap",
            Self::Heavy => "heavy",
            Self::Cloud => "cloud",
        }
    }
}

/// A named monitoring line that caused a detection to be searched for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLine {
    pub name: String,
    pub segment: Segment,
}

impl TriggerLine {
    pub fn new(name: impl Into<String>, segment: Segment) -> Self {
        Self {
            name: name.into(),
            segment,
        }
    }
}

/// One labeled box from one detector invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// [0, 1]
    pub confidence: f32,
    pub bbox: BBox,
    pub track_id: Option<u64>,
    pub stage: StageId,
    pub provenance: Provenance,
    pub trigger_line: Option<TriggerLine>,
    /// Should a more expensive tier look at this region again?
    pub triggers_escalation: bool,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            track_id: None,
            stage: StageId::UNASSIGNED,
            provenance: Provenance::Unassigned,
            trigger_line: None,
            triggers_escalation: false,
        }
    }

    /// Record which stage and tier produced this detection.
    pub fn stamped(mut self, stage: StageId, provenance: Provenance) -> Self {
        self.stage = stage;
        self.provenance = provenance;
        self
    }

    pub fn with_trigger_line(mut self, line: Option<TriggerLine>) -> Self {
        self.trigger_line = line;
        self
    }

    pub fn with_escalation(mut self, triggers: bool) -> Self {
        self.triggers_escalation = triggers;
        self
    }

    pub fn trigger_name(&self) -> Option<&str> {
        self.trigger_line.as_ref().map(|l| l.name.as_str())
    }
}
