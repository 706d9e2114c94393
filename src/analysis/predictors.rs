// src/analysis/predictors.rs
//
// Motion predictors for path stitching. Given a path and the bundle history,
// a predictor proposes the single best bundle just beyond one end of the
// path.
//
// Candidate rules (shared by every predictor):
//   - strictly earlier than the path's first frame (Backward) or strictly
//     later than its last frame (Forward)
//   - within `max_frame_gap` frames of that end
//   - not already in the path
//   - scored by IoU between the predicted box at the candidate's frame and
//     the candidate's representative (mean) box
//   - must score above `similarity_floor`
//   - best score wins; ties go to the candidate nearest in time
//
// Predictors read the path and the history and never modify either.

use crate::detection::{DetectionBundle, ItemPath};
use crate::frame_buffer::BundleHistory;
use crate::geometry::{box_similarity, BBox};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bundle: Arc<DetectionBundle>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub similarity_floor: f32,
    pub max_frame_gap: u64,
}

pub trait Predictor: Send {
    fn name(&self) -> &'static str;

    fn predict(
        &self,
        path: &ItemPath,
        history: &BundleHistory,
        direction: Direction,
        params: &SearchParams,
    ) -> Option<Candidate>;
}

/// Walk the eligible candidates and keep the best one according to
/// `predict_box`, which maps a frame index to the box expected there.
fn best_candidate<F>(
    path: &ItemPath,
    history: &BundleHistory,
    direction: Direction,
    params: &SearchParams,
    predict_box: F,
) -> Option<Candidate>
where
    F: Fn(u64) -> Option<BBox>,
{
    let edge = match direction {
        Direction::Forward => path.last_frame(),
        Direction::Backward => path.first_frame(),
    };
    let in_range = |frame: u64| match direction {
        Direction::Forward => frame > edge && frame - edge <= params.max_frame_gap,
        Direction::Backward => frame < edge && edge - frame <= params.max_frame_gap,
    };

    let mut best: Option<(Candidate, u64)> = None;

    for bundle in history.iter() {
        let frame = bundle.frame_index();
        if !in_range(frame) || path.contains(bundle) {
            continue;
        }
        let Some(actual) = bundle.representative_box() else {
            continue;
        };
        if actual.is_degenerate() {
            continue;
        }
        let Some(predicted) = predict_box(frame) else {
            continue;
        };

        let score = box_similarity(&predicted, &actual);
        if score <= params.similarity_floor {
            continue;
        }

        let distance = frame.abs_diff(edge);
        let better = match &best {
            None => true,
            Some((current, current_dist)) => {
                score > current.score || (score == current.score && distance < *current_dist)
            }
        };
        if better {
            best = Some((
                Candidate {
                    bundle: bundle.clone(),
                    score,
                },
                distance,
            ));
        }
    }

    best.map(|(c, _)| c)
}

/// Bundles at the relevant end of the path, closest to the end first.
fn end_bundles(path: &ItemPath, direction: Direction, window: usize) -> Vec<&Arc<DetectionBundle>> {
    match direction {
        Direction::Forward => path.bundles().iter().rev().take(window).collect(),
        Direction::Backward => path.bundles().iter().take(window).collect(),
    }
}

// ============================================================================
// OVERLAP PREDICTOR
// ============================================================================

/// Assumes the object has not moved: the predicted box is the end bundle's
/// own representative box.
#[derive(Debug, Default, Clone)]
pub struct OverlapPredictor;

impl Predictor for OverlapPredictor {
    fn name(&self) -> &'static str {
        "overlap"
    }

    fn predict(
        &self,
        path: &ItemPath,
        history: &BundleHistory,
        direction: Direction,
        params: &SearchParams,
    ) -> Option<Candidate> {
        let end = match direction {
            Direction::Forward => path.last(),
            Direction::Backward => path.first(),
        };
        let anchor = end.representative_box()?;
        best_candidate(path, history, direction, params, |_| Some(anchor))
    }
}

// ============================================================================
// POLYNOMIAL PREDICTOR
// ============================================================================

/// Fits center x, center y, width and height against frame index with a
/// least-squares polynomial over the last `fit_window` bundles at the
/// relevant end, then extrapolates to each candidate's frame.
#[derive(Debug, Clone)]
pub struct PolynomialPredictor {
    degree: usize,
    fit_window: usize,
}

impl PolynomialPredictor {
    pub fn new(degree: usize, fit_window: usize) -> Self {
        Self {
            degree,
            fit_window: fit_window.max(1),
        }
    }

    /// Per-component coefficients, lowest order first, plus the frame index
    /// used as t = 0.
    fn fit(&self, path: &ItemPath, direction: Direction) -> Option<(u64, [Vec<f64>; 4])> {
        let samples: Vec<(u64, BBox)> = end_bundles(path, direction, self.fit_window)
            .into_iter()
            .filter_map(|b| b.representative_box().map(|r| (b.frame_index(), r)))
            .collect();
        let (origin, _) = *samples.first()?;

        let ts: Vec<f64> = samples
            .iter()
            .map(|(f, _)| *f as f64 - origin as f64)
            .collect();
        let comps: [Vec<f64>; 4] = [
            samples.iter().map(|(_, b)| b.center().0 as f64).collect(),
            samples.iter().map(|(_, b)| b.center().1 as f64).collect(),
            samples.iter().map(|(_, b)| b.width() as f64).collect(),
            samples.iter().map(|(_, b)| b.height() as f64).collect(),
        ];

        // Degree is bounded by the number of distinct sample times.
        let mut distinct = ts.clone();
        distinct.dedup();
        let mut degree = self.degree.min(distinct.len().saturating_sub(1));

        loop {
            let fitted: Option<Vec<Vec<f64>>> =
                comps.iter().map(|ys| polyfit(&ts, ys, degree)).collect();
            if let Some(coeffs) = fitted {
                let [cx, cy, w, h]: [Vec<f64>; 4] = coeffs.try_into().ok()?;
                return Some((origin, [cx, cy, w, h]));
            }
            if degree == 0 {
                return None;
            }
            degree -= 1;
        }
    }
}

impl Predictor for PolynomialPredictor {
    fn name(&self) -> &'static str {
        "polynomial"
    }

    fn predict(
        &self,
        path: &ItemPath,
        history: &BundleHistory,
        direction: Direction,
        params: &SearchParams,
    ) -> Option<Candidate> {
        let (origin, [cx, cy, w, h]) = self.fit(path, direction)?;
        debug!(
            "📈 {} fit over {} bundle(s), degree {}",
            direction.as_str(),
            path.len().min(self.fit_window),
            cx.len() - 1
        );
        best_candidate(path, history, direction, params, |frame| {
            let t = frame as f64 - origin as f64;
            let bbox = BBox::from_center(
                polyval(&cx, t) as f32,
                polyval(&cy, t) as f32,
                polyval(&w, t) as f32,
                polyval(&h, t) as f32,
            );
            bbox.is_finite().then_some(bbox)
        })
    }
}

fn polyval(coeffs: &[f64], t: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * t + c)
}

/// Least-squares polynomial fit via the normal equations. `None` when the
/// system is singular.
fn polyfit(ts: &[f64], ys: &[f64], degree: usize) -> Option<Vec<f64>> {
    let n = degree + 1;
    if ts.len() < n || ts.len() != ys.len() {
        return None;
    }

    // Augmented matrix [AᵀA | Aᵀy]
    let mut m = vec![vec![0.0f64; n + 1]; n];
    for (&t, &y) in ts.iter().zip(ys) {
        let mut powers = vec![1.0f64; 2 * n - 1];
        for k in 1..powers.len() {
            powers[k] = powers[k - 1] * t;
        }
        for r in 0..n {
            for c in 0..n {
                m[r][c] += powers[r + c];
            }
            m[r][n] += powers[r] * y;
        }
    }

    // Gaussian elimination with partial pivoting
    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| {
            m[a][col]
                .abs()
                .partial_cmp(&m[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-9 {
            return None;
        }
        m.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut coeffs = vec![0.0f64; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| m[row][k] * coeffs[k]).sum();
        coeffs[row] = (m[row][n] - tail) / m[row][row];
    }
    coeffs.iter().all(|c| c.is_finite()).then_some(coeffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::types::Frame;
    use image::RgbImage;

    fn bundle(index: u64, x: f32) -> Arc<DetectionBundle> {
        Arc::new(DetectionBundle::new(
            Frame::new(index, RgbImage::new(2, 2)).into_shared(),
            Detection::new("car", 0.9, BBox::new(x, 0.0, x + 20.0, 20.0)),
        ))
    }

    fn params() -> SearchParams {
        SearchParams {
            similarity_floor: 0.3,
            max_frame_gap: 30,
        }
    }

    #[test]
    fn test_polyfit_recovers_line() {
        let ts = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let c = polyfit(&ts, &ys, 1).unwrap();
        assert!((c[0] - 1.0).abs() < 1e-6);
        assert!((c[1] - 2.0).abs() < 1e-6);
        assert!((polyval(&c, 10.0) - 21.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_predictor_finds_backward_neighbor() {
        let mut history = BundleHistory::new(90).unwrap();
        let older = bundle(9, 2.0);
        history.push(older.clone());
        history.push(bundle(8, 100.0));
        let path = ItemPath::new(bundle(10, 0.0));

        let found = OverlapPredictor
            .predict(&path, &history, Direction::Backward, &params())
            .unwrap();
        assert!(Arc::ptr_eq(&found.bundle, &older));
        assert!(OverlapPredictor
            .predict(&path, &history, Direction::Forward, &params())
            .is_none());
    }

    #[test]
    fn test_polynomial_predictor_follows_motion() {
        // Object moves +10px per frame. The overlap predictor would score the
        // F13 box against F12's position; the polynomial one predicts it.
        let mut path = ItemPath::new(bundle(10, 0.0));
        assert!(path.extend_forward(bundle(11, 10.0)));
        assert!(path.extend_forward(bundle(12, 20.0)));

        let mut history = BundleHistory::new(90).unwrap();
        let next = bundle(13, 30.0);
        history.push(next.clone());

        let poly = PolynomialPredictor::new(2, 10);
        let found = poly
            .predict(&path, &history, Direction::Forward, &params())
            .unwrap();
        assert!(Arc::ptr_eq(&found.bundle, &next));
        assert!(found.score > 0.99, "score {}", found.score);

        let overlap = OverlapPredictor
            .predict(&path, &history, Direction::Forward, &params())
            .unwrap();
        assert!(overlap.score < found.score);
    }

    #[test]
    fn test_single_bundle_path_falls_back_to_constant() {
        let path = ItemPath::new(bundle(10, 0.0));
        let mut history = BundleHistory::new(90).unwrap();
        history.push(bundle(11, 1.0));
        let poly = PolynomialPredictor::new(2, 10);
        assert!(poly
            .predict(&path, &history, Direction::Forward, &params())
            .is_some());
    }

    #[test]
    fn test_gap_and_floor_exclude_candidates() {
        let path = ItemPath::new(bundle(100, 0.0));
        let mut history = BundleHistory::new(200).unwrap();
        history.push(bundle(50, 0.0)); // too far back
        history.push(bundle(99, 15.0)); // IoU 5/35 under the floor
        assert!(OverlapPredictor
            .predict(&path, &history, Direction::Backward, &params())
            .is_none());
    }

    #[test]
    fn test_tie_prefers_nearest_frame() {
        let path = ItemPath::new(bundle(10, 0.0));
        let mut history = BundleHistory::new(90).unwrap();
        history.push(bundle(5, 0.0));
        let near = bundle(8, 0.0);
        history.push(near.clone());
        let found = OverlapPredictor
            .predict(&path, &history, Direction::Backward, &params())
            .unwrap();
        assert!(Arc::ptr_eq(&found.bundle, &near));
    }
}
