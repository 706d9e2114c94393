// src/detection/bundle.rs
//
// DetectionBundle: every detection accumulated for one frame region across
// the stages that looked at it. ItemPath: bundles believed to be the same
// physical object over time.
//
// Bundles share their Frame through an Arc, so a bundle (or a path holding
// it) stays valid after the frame history evicts that frame.

use super::types::{Detection, StageId};
use crate::geometry::{mean_box, BBox};
use crate::types::SharedFrame;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DetectionBundle {
    frame: SharedFrame,
    detections: Vec<Detection>,
}

impl DetectionBundle {
    pub fn new(frame: SharedFrame, first: Detection) -> Self {
        Self {
            frame,
            detections: vec![first],
        }
    }

    pub fn frame(&self) -> &SharedFrame {
        &self.frame
    }

    pub fn frame_index(&self) -> u64 {
        self.frame.index
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.frame.timestamp_ms
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn latest(&self) -> Option<&Detection> {
        self.detections.last()
    }

    /// Append a detection from a later stage. Earlier detections are never
    /// touched.
    pub fn push(&mut self, detection: Detection) {
        self.detections.push(detection);
    }

    /// Mean box over every detection in the bundle. This is the region used
    /// for identity merging and path prediction.
    pub fn representative_box(&self) -> Option<BBox> {
        mean_box(self.detections.iter().map(|d| &d.bbox))
    }

    /// Label of the highest-confidence detection.
    pub fn label(&self) -> Option<&str> {
        self.detections
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|d| d.label.as_str())
    }

    pub fn max_confidence(&self) -> f32 {
        self.detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0, f32::max)
    }

    pub fn has_detection_from(&self, stage: StageId) -> bool {
        self.detections.iter().any(|d| d.stage == stage)
    }

    /// True while any detection still asks for a more expensive look.
    pub fn has_pending_escalation(&self) -> bool {
        self.detections.iter().any(|d| d.triggers_escalation)
    }

    /// Indices of detections whose trigger flag is still set.
    pub fn pending_escalations(&self) -> Vec<usize> {
        self.detections
            .iter()
            .enumerate()
            .filter(|(_, d)| d.triggers_escalation)
            .map(|(i, _)| i)
            .collect()
    }

    /// Clear the trigger flag so the same detection is not escalated twice.
    pub fn consume_trigger(&mut self, idx: usize) {
        if let Some(d) = self.detections.get_mut(idx) {
            d.triggers_escalation = false;
        }
    }

    pub fn track_id(&self) -> Option<u64> {
        self.detections.iter().find_map(|d| d.track_id)
    }

    pub fn assign_track_id(&mut self, id: u64) {
        for d in &mut self.detections {
            d.track_id = Some(id);
        }
    }
}

// ============================================================================
// PATH
// ============================================================================

/// Ordered bundles of one object, non-decreasing in frame index.
#[derive(Debug, Clone)]
pub struct ItemPath {
    bundles: Vec<Arc<DetectionBundle>>,
}

impl ItemPath {
    pub fn new(seed: Arc<DetectionBundle>) -> Self {
        Self {
            bundles: vec![seed],
        }
    }

    pub fn bundles(&self) -> &[Arc<DetectionBundle>] {
        &self.bundles
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn first(&self) -> &Arc<DetectionBundle> {
        &self.bundles[0]
    }

    pub fn last(&self) -> &Arc<DetectionBundle> {
        &self.bundles[self.bundles.len() - 1]
    }

    pub fn first_frame(&self) -> u64 {
        self.first().frame_index()
    }

    pub fn last_frame(&self) -> u64 {
        self.last().frame_index()
    }

    pub fn frame_indices(&self) -> Vec<u64> {
        self.bundles.iter().map(|b| b.frame_index()).collect()
    }

    pub fn contains(&self, bundle: &Arc<DetectionBundle>) -> bool {
        self.bundles.iter().any(|b| Arc::ptr_eq(b, bundle))
    }

    /// Append after the latest bundle. Rejected if it would break ordering.
    pub fn extend_forward(&mut self, bundle: Arc<DetectionBundle>) -> bool {
        if bundle.frame_index() < self.last_frame() || self.contains(&bundle) {
            return false;
        }
        self.bundles.push(bundle);
        true
    }

    /// Prepend before the earliest bundle. Rejected if it would break ordering.
    pub fn extend_backward(&mut self, bundle: Arc<DetectionBundle>) -> bool {
        if bundle.frame_index() > self.first_frame() || self.contains(&bundle) {
            return false;
        }
        self.bundles.insert(0, bundle);
        true
    }

    /// Swap one bundle for another snapshot of it (same frame).
    pub fn replace(&mut self, old: &Arc<DetectionBundle>, new: Arc<DetectionBundle>) -> bool {
        match self.bundles.iter().position(|b| Arc::ptr_eq(b, old)) {
            Some(pos) if new.frame_index() == old.frame_index() => {
                self.bundles[pos] = new;
                true
            }
            _ => false,
        }
    }

    /// First track id already carried by any bundle in the path.
    pub fn track_id(&self) -> Option<u64> {
        self.bundles.iter().find_map(|b| b.track_id())
    }

    pub fn label(&self) -> Option<&str> {
        self.bundles.last().and_then(|b| b.label())
    }
}
