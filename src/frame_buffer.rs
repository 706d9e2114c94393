// src/frame_buffer.rs
//
// Bounded lookback stores.
//
//   FrameHistory: raw frames only, fixed capacity, FIFO eviction. The
//                 escalation cascade walks it backward from the newest
//                 frame to find where a line event started.
//   BundleHistory: finalized detection bundles within a frame-index window.
//                 The path tracker stitches new bundles against it.
//
// Both hold Arc handles: evicting an entry never invalidates a bundle or a
// path that still references the same frame.

use crate::detection::DetectionBundle;
use crate::geometry::{box_similarity, BBox};
use crate::types::SharedFrame;
use anyhow::{ensure, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// FRAME HISTORY
// ============================================================================

pub struct FrameHistory {
    frames: VecDeque<SharedFrame>,
    capacity: usize,
}

impl FrameHistory {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "frame history capacity must be > 0");
        Ok(Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Push the newest frame. Returns the evicted frame when full.
    pub fn push(&mut self, frame: SharedFrame) -> Option<SharedFrame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            debug!("🗑️  Frame history evicted F{}", old.index);
        }
        self.frames.push_back(frame);
        evicted
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&SharedFrame> {
        self.frames.back()
    }

    pub fn oldest(&self) -> Option<&SharedFrame> {
        self.frames.front()
    }

    /// Frame `offset` steps back from the newest (0 = newest).
    pub fn back(&self, offset: usize) -> Option<&SharedFrame> {
        let len = self.frames.len();
        if offset >= len {
            return None;
        }
        self.frames.get(len - 1 - offset)
    }

    /// Newest first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &SharedFrame> {
        self.frames.iter().rev()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SharedFrame> {
        self.frames.iter()
    }

    pub fn find(&self, frame_index: u64) -> Option<&SharedFrame> {
        self.frames.iter().rev().find(|f| f.index == frame_index)
    }

}

// ============================================================================
// BUNDLE HISTORY
// ============================================================================

pub struct BundleHistory {
    bundles: VecDeque<Arc<DetectionBundle>>,
    window: u64,
}

impl BundleHistory {
    pub fn new(window: u64) -> Result<Self> {
        ensure!(window > 0, "bundle history window must be > 0");
        Ok(Self {
            bundles: VecDeque::new(),
            window,
        })
    }

    /// Insert keeping frame-index order, then drop everything that fell out
    /// of the window relative to the newest bundle.
    pub fn push(&mut self, bundle: Arc<DetectionBundle>) {
        let idx = bundle.frame_index();
        let pos = self
            .bundles
            .iter()
            .rposition(|b| b.frame_index() <= idx)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.bundles.insert(pos, bundle);

        if let Some(newest) = self.bundles.back().map(|b| b.frame_index()) {
            self.prune(newest);
        }
    }

    /// Drop bundles older than `window` frames before `current_frame`.
    pub fn prune(&mut self, current_frame: u64) {
        let cutoff = current_frame.saturating_sub(self.window);
        while let Some(front) = self.bundles.front() {
            if front.frame_index() >= cutoff {
                break;
            }
            self.bundles.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<DetectionBundle>> {
        self.bundles.iter()
    }

    /// Best-overlapping finalized bundle anchored to `frame_index`, if any
    /// overlaps `bbox` at all.
    pub fn find_overlapping(&self, frame_index: u64, bbox: &BBox) -> Option<&Arc<DetectionBundle>> {
        let mut best: Option<(&Arc<DetectionBundle>, f32)> = None;
        for bundle in self.bundles.iter().filter(|b| b.frame_index() == frame_index) {
            let Some(rep) = bundle.representative_box() else {
                continue;
            };
            let score = box_similarity(&rep, bbox);
            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((bundle, score));
            }
        }
        best.map(|(b, _)| b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::geometry::BBox;
    use crate::types::Frame;
    use image::RgbImage;

    fn frame(index: u64) -> SharedFrame {
        Frame::new(index, RgbImage::new(2, 2)).into_shared()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(FrameHistory::new(0).is_err());
        assert!(BundleHistory::new(0).is_err());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut history = FrameHistory::new(3).unwrap();
        for i in 0..3 {
            assert!(history.push(frame(i)).is_none());
        }
        let evicted = history.push(frame(3)).unwrap();
        assert_eq!(evicted.index, 0);
        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest().unwrap().index, 1);
        assert_eq!(history.latest().unwrap().index, 3);
    }

    #[test]
    fn test_backward_access() {
        let mut history = FrameHistory::new(5).unwrap();
        for i in 8..=12 {
            history.push(frame(i));
        }
        assert_eq!(history.back(0).unwrap().index, 12);
        assert_eq!(history.back(4).unwrap().index, 8);
        assert!(history.back(5).is_none());
        let order: Vec<u64> = history.iter_recent().map(|f| f.index).collect();
        assert_eq!(order, vec![12, 11, 10, 9, 8]);
        assert_eq!(history.find(10).unwrap().index, 10);
    }

    #[test]
    fn test_eviction_keeps_shared_frame_alive() {
        let mut history = FrameHistory::new(1).unwrap();
        let held = frame(1);
        history.push(held.clone());
        history.push(frame(2));
        assert_eq!(held.index, 1);
        assert_eq!(history.latest().unwrap().index, 2);
    }

    #[test]
    fn test_bundle_history_orders_and_prunes() {
        let mut history = BundleHistory::new(10).unwrap();
        let make = |i: u64| {
            Arc::new(DetectionBundle::new(
                frame(i),
                Detection::new("car", 0.9, BBox::new(0.0, 0.0, 1.0, 1.0)),
            ))
        };
        history.push(make(5));
        history.push(make(3));
        history.push(make(7));
        let order: Vec<u64> = history.iter().map(|b| b.frame_index()).collect();
        assert_eq!(order, vec![3, 5, 7]);

        history.push(make(15));
        let order: Vec<u64> = history.iter().map(|b| b.frame_index()).collect();
        assert_eq!(order, vec![5, 7, 15]);
    }

    #[test]
    fn test_find_overlapping_same_frame_only() {
        let mut history = BundleHistory::new(10).unwrap();
        let at = |i: u64, x: f32| {
            Arc::new(DetectionBundle::new(
                frame(i),
                Detection::new("car", 0.9, BBox::new(x, 0.0, x + 10.0, 10.0)),
            ))
        };
        history.push(at(4, 0.0));
        history.push(at(4, 50.0));
        history.push(at(5, 0.0));

        let hit = history.find_overlapping(4, &BBox::new(52.0, 0.0, 62.0, 10.0)).unwrap();
        assert_eq!(hit.frame_index(), 4);
        assert_eq!(hit.representative_box().unwrap().x1, 50.0);
        assert!(history.find_overlapping(4, &BBox::new(20.0, 0.0, 30.0, 10.0)).is_none());
        assert!(history.find_overlapping(6, &BBox::new(0.0, 0.0, 10.0, 10.0)).is_none());
    }
}
