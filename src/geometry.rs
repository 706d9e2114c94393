// src/geometry.rs
//
// Shared geometric scoring for the merge resolver, the line stage, the
// escalation cascade and the path predictors.
//
// Every scoring function is total: degenerate inputs (zero-area boxes,
// coincident segment endpoints, NaN coordinates) score 0.0 instead of NaN.

use serde::{Deserialize, Serialize};

// ============================================================================
// TYPES
// ============================================================================

/// Axis-aligned bounding box in pixel coordinates, `[x1, y1]` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    /// Build a box from a center point and a size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        let (hw, hh) = (w.max(0.0) * 0.5, h.max(0.0) * 0.5);
        Self::new(cx - hw, cy - hh, cx + hw, cy + hh)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Zero-area or non-finite boxes never score.
    pub fn is_degenerate(&self) -> bool {
        !self.is_finite() || self.area() <= 0.0
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

/// A named monitoring line is just two endpoints in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: [f32; 2],
    pub end: [f32; 2],
}

impl Segment {
    pub fn new(start: [f32; 2], end: [f32; 2]) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f32 {
        let dx = self.end[0] - self.start[0];
        let dy = self.end[1] - self.start[1];
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.start.iter().chain(self.end.iter()).all(|v| v.is_finite())
    }

    pub fn is_degenerate(&self) -> bool {
        !self.is_finite() || self.length() <= f32::EPSILON
    }

    /// Point at parameter `t` in [0, 1] along the segment.
    pub fn point_at(&self, t: f32) -> (f32, f32) {
        (
            self.start[0] + (self.end[0] - self.start[0]) * t,
            self.start[1] + (self.end[1] - self.start[1]) * t,
        )
    }
}

// ============================================================================
// BOX ↔ BOX
// ============================================================================

/// Intersection-over-union of two boxes. 0 = disjoint, 1 = identical.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    if a.is_degenerate() || b.is_degenerate() {
        return 0.0;
    }

    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }

    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Similarity score used for identity resolution. Currently plain IoU.
pub fn box_similarity(a: &BBox, b: &BBox) -> f32 {
    iou(a, b)
}

/// Component-wise mean of a set of boxes. `None` when the set is empty.
pub fn mean_box<'a, I>(boxes: I) -> Option<BBox>
where
    I: IntoIterator<Item = &'a BBox>,
{
    let mut sum = [0.0f32; 4];
    let mut n = 0usize;
    for b in boxes {
        sum[0] += b.x1;
        sum[1] += b.y1;
        sum[2] += b.x2;
        sum[3] += b.y2;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    let inv = 1.0 / n as f32;
    Some(BBox::new(sum[0] * inv, sum[1] * inv, sum[2] * inv, sum[3] * inv))
}

// ============================================================================
// SEGMENT ↔ BOX
// ============================================================================

/// Fraction of the segment's length that lies inside the box, in [0, 1].
///
/// Liang–Barsky clipping of the segment against the box. A zero-area box or
/// a zero-length segment overlaps nothing.
pub fn segment_box_overlap(seg: &Segment, bbox: &BBox) -> f32 {
    if seg.is_degenerate() || bbox.is_degenerate() {
        return 0.0;
    }

    let dx = seg.end[0] - seg.start[0];
    let dy = seg.end[1] - seg.start[1];
    let p = [-dx, dx, -dy, dy];
    let q = [
        seg.start[0] - bbox.x1,
        bbox.x2 - seg.start[0],
        seg.start[1] - bbox.y1,
        bbox.y2 - seg.start[1],
    ];

    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    for i in 0..4 {
        if p[i] == 0.0 {
            // Parallel to this edge: either fully outside or unconstrained
            if q[i] < 0.0 {
                return 0.0;
            }
            continue;
        }
        let r = q[i] / p[i];
        if p[i] < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return 0.0;
        }
    }

    (t1 - t0).clamp(0.0, 1.0)
}

/// Euclidean distance from a point to the closest point of the segment.
/// A degenerate segment collapses to its start point.
pub fn distance_to_segment(x: f32, y: f32, seg: &Segment) -> f32 {
    let dx = seg.end[0] - seg.start[0];
    let dy = seg.end[1] - seg.start[1];
    let len_sq = dx * dx + dy * dy;

    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((x - seg.start[0]) * dx + (y - seg.start[1]) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (px, py) = seg.point_at(t);
    ((x - px).powi(2) + (y - py).powi(2)).sqrt()
}

/// Distance from the box center to the segment.
pub fn box_distance_to_segment(bbox: &BBox, seg: &Segment) -> f32 {
    let (cx, cy) = bbox.center();
    distance_to_segment(cx, cy, seg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BBox::new(50.0, 50.0, 150.0, 150.0);
        assert!((iou(&a, &b) - 2500.0 / 17500.0).abs() < 1e-4);
    }

    #[test]
    fn test_iou_disjoint_and_degenerate() {
        let a = BBox::new(0.0, 0.0, 50.0, 50.0);
        let b = BBox::new(100.0, 100.0, 200.0, 200.0);
        assert_eq!(iou(&a, &b), 0.0);

        let flat = BBox::new(10.0, 10.0, 10.0, 40.0);
        assert_eq!(iou(&a, &flat), 0.0);

        let nan = BBox::new(f32::NAN, 0.0, 10.0, 10.0);
        assert_eq!(iou(&a, &nan), 0.0);
    }

    #[test]
    fn test_segment_fully_inside_box() {
        let seg = Segment::new([10.0, 50.0], [90.0, 50.0]);
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((segment_box_overlap(&seg, &bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_segment_half_inside_box() {
        let seg = Segment::new([0.0, 50.0], [200.0, 50.0]);
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((segment_box_overlap(&seg, &bbox) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_segment_misses_box() {
        let seg = Segment::new([0.0, 150.0], [200.0, 150.0]);
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(segment_box_overlap(&seg, &bbox), 0.0);
    }

    #[test]
    fn test_overlap_with_zero_area_box_is_zero() {
        let seg = Segment::new([0.0, 50.0], [200.0, 50.0]);
        let point_box = BBox::new(50.0, 50.0, 50.0, 50.0);
        let score = segment_box_overlap(&seg, &point_box);
        assert_eq!(score, 0.0);
        assert!(!score.is_nan());
    }

    #[test]
    fn test_overlap_with_coincident_endpoints_is_zero() {
        let seg = Segment::new([50.0, 50.0], [50.0, 50.0]);
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(segment_box_overlap(&seg, &bbox), 0.0);
    }

    #[test]
    fn test_distance_to_segment() {
        let seg = Segment::new([0.0, 0.0], [100.0, 0.0]);
        assert!((distance_to_segment(50.0, 30.0, &seg) - 30.0).abs() < 1e-5);
        assert!((distance_to_segment(130.0, 40.0, &seg) - 50.0).abs() < 1e-4);

        let degenerate = Segment::new([10.0, 10.0], [10.0, 10.0]);
        assert!((distance_to_segment(13.0, 14.0, &degenerate) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_mean_box() {
        let boxes = [BBox::new(0.0, 0.0, 10.0, 10.0), BBox::new(10.0, 10.0, 30.0, 30.0)];
        let m = mean_box(boxes.iter()).unwrap();
        assert_eq!(m, BBox::new(5.0, 5.0, 20.0, 20.0));
        assert!(mean_box(std::iter::empty()).is_none());
    }
}
