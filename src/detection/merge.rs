// src/detection/merge.rs
//
// Identity merge resolver. Decides whether a new detection extends an
// existing bundle or starts a new one.
//
// Rules:
//   - Only bundles anchored to the same frame are candidates (a bundle never
//     mixes frames).
//   - Score = IoU between the new box and the bundle's representative box.
//   - Strictly greatest score wins; ties keep the first bundle in list order.
//   - A score of 0 never merges.
//
// `resolve` reads the list and nothing else, so calling it twice on the same
// list and box gives the same answer.

use super::bundle::DetectionBundle;
use super::types::Detection;
use crate::geometry::{box_similarity, BBox};
use crate::types::SharedFrame;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeDecision {
    /// Append to the bundle at this index
    Extend { index: usize, similarity: f32 },
    /// No overlapping bundle on this frame
    Create,
}

/// Pick the target bundle for a box observed on `frame_index`.
pub fn resolve(bundles: &[DetectionBundle], frame_index: u64, bbox: &BBox) -> MergeDecision {
    let mut best: Option<(usize, f32)> = None;

    for (idx, bundle) in bundles.iter().enumerate() {
        if bundle.frame_index() != frame_index {
            continue;
        }
        let Some(region) = bundle.representative_box() else {
            continue;
        };
        let similarity = box_similarity(&region, bbox);
        if similarity <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_sim)) if similarity <= best_sim => {}
            _ => best = Some((idx, similarity)),
        }
    }

    match best {
        Some((index, similarity)) => MergeDecision::Extend { index, similarity },
        None => MergeDecision::Create,
    }
}

/// Merge a detection into the list, creating a bundle anchored to `frame`
/// when nothing overlaps. Returns the index of the bundle that received it.
pub fn merge_detection(
    bundles: &mut Vec<DetectionBundle>,
    frame: &SharedFrame,
    detection: Detection,
) -> usize {
    match resolve(bundles, frame.index, &detection.bbox) {
        MergeDecision::Extend { index, similarity } => {
            debug!(
                "🔗 F{}: {} ({:.2}) merged into bundle #{} (sim={:.2})",
                frame.index, detection.label, detection.confidence, index, similarity
            );
            bundles[index].push(detection);
            index
        }
        MergeDecision::Create => {
            debug!(
                "🆕 F{}: new bundle #{} for {} ({:.2})",
                frame.index,
                bundles.len(),
                detection.label,
                detection.confidence
            );
            bundles.push(DetectionBundle::new(frame.clone(), detection));
            bundles.len() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frame;
    use image::RgbImage;

    fn frame(index: u64) -> SharedFrame {
        Frame::new(index, RgbImage::new(4, 4)).into_shared()
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new("car", 0.8, BBox::new(x1, y1, x2, y2))
    }

    #[test]
    fn test_empty_list_always_creates() {
        let bundles: Vec<DetectionBundle> = Vec::new();
        let decision = resolve(&bundles, 1, &BBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(decision, MergeDecision::Create);
    }

    #[test]
    fn test_single_bundle_merges_on_overlap_and_creates_otherwise() {
        let f = frame(1);
        let mut bundles = vec![DetectionBundle::new(f.clone(), det(0.0, 0.0, 10.0, 10.0))];

        let idx = merge_detection(&mut bundles, &f, det(5.0, 5.0, 15.0, 15.0));
        assert_eq!(idx, 0);
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].len(), 2);

        let idx = merge_detection(&mut bundles, &f, det(100.0, 100.0, 110.0, 110.0));
        assert_eq!(idx, 1);
        assert_eq!(bundles.len(), 2);
        assert!(std::sync::Arc::ptr_eq(bundles[1].frame(), &f));
    }

    #[test]
    fn test_greatest_similarity_wins() {
        let f = frame(1);
        let bundles = vec![
            DetectionBundle::new(f.clone(), det(0.0, 0.0, 10.0, 10.0)),
            DetectionBundle::new(f.clone(), det(4.0, 0.0, 14.0, 10.0)),
        ];
        match resolve(&bundles, 1, &BBox::new(5.0, 0.0, 15.0, 10.0)) {
            MergeDecision::Extend { index, .. } => assert_eq!(index, 1),
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_tie_keeps_first_bundle() {
        let f = frame(1);
        let bundles = vec![
            DetectionBundle::new(f.clone(), det(0.0, 0.0, 10.0, 10.0)),
            DetectionBundle::new(f.clone(), det(0.0, 0.0, 10.0, 10.0)),
        ];
        match resolve(&bundles, 1, &BBox::new(0.0, 0.0, 10.0, 10.0)) {
            MergeDecision::Extend { index, .. } => assert_eq!(index, 0),
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_other_frames_are_not_candidates() {
        let bundles = vec![DetectionBundle::new(frame(7), det(0.0, 0.0, 10.0, 10.0))];
        assert_eq!(
            resolve(&bundles, 8, &BBox::new(0.0, 0.0, 10.0, 10.0)),
            MergeDecision::Create
        );
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let f = frame(1);
        let bundles = vec![
            DetectionBundle::new(f.clone(), det(0.0, 0.0, 10.0, 10.0)),
            DetectionBundle::new(f.clone(), det(8.0, 8.0, 20.0, 20.0)),
            DetectionBundle::new(f.clone(), det(50.0, 50.0, 60.0, 60.0)),
        ];
        let query = BBox::new(6.0, 6.0, 16.0, 16.0);
        let first = resolve(&bundles, 1, &query);
        let second = resolve(&bundles, 1, &query);
        assert_eq!(first, second);
    }
}
