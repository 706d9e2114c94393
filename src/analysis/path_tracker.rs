// src/analysis/path_tracker.rs
//
// Stitches a finalized bundle into a multi-frame path.
//
// Each pass asks every configured predictor for the best candidate before
// the path's first bundle and after its last one. The highest-scoring
// proposal per direction is taken (ties go to the predictor configured
// first). The loop ends on the first pass where neither direction grows.
// Every pass either adds a bundle or stops, so the number of passes is
// bounded by the history size.

use super::predictors::{Candidate, Direction, OverlapPredictor, PolynomialPredictor, Predictor, SearchParams};
use crate::detection::{DetectionBundle, ItemPath};
use crate::frame_buffer::BundleHistory;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    Polynomial,
    Overlap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTrackerConfig {
    /// Candidate must overlap its predicted box by more than this
    pub similarity_floor: f32,
    /// Largest frame gap bridged in one step
    pub max_frame_gap: u64,
    /// Consulted in order; earlier entries win ties
    pub predictors: Vec<PredictorKind>,
    pub polynomial_degree: usize,
    /// Bundles at the path end used for the polynomial fit
    pub fit_window: usize,
}

impl Default for PathTrackerConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.3,
            max_frame_gap: 30,
            predictors: vec![PredictorKind::Polynomial, PredictorKind::Overlap],
            polynomial_degree: 2,
            fit_window: 10,
        }
    }
}

impl PathTrackerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.similarity_floor),
            "tracker.similarity_floor must be in [0, 1] (got {})",
            self.similarity_floor
        );
        ensure!(self.max_frame_gap > 0, "tracker.max_frame_gap must be > 0");
        ensure!(!self.predictors.is_empty(), "tracker.predictors must not be empty");
        ensure!(self.fit_window > 0, "tracker.fit_window must be > 0");
        Ok(())
    }

    fn build_predictors(&self) -> Vec<Box<dyn Predictor>> {
        self.predictors
            .iter()
            .map(|kind| -> Box<dyn Predictor> {
                match kind {
                    PredictorKind::Polynomial => {
                        Box::new(PolynomialPredictor::new(self.polynomial_degree, self.fit_window))
                    }
                    PredictorKind::Overlap => Box::new(OverlapPredictor),
                }
            })
            .collect()
    }
}

pub struct PathTracker {
    params: SearchParams,
    predictors: Vec<Box<dyn Predictor>>,
}

impl PathTracker {
    pub fn new(config: &PathTrackerConfig) -> Result<Self> {
        config.validate()?;
        Self::with_predictors(config, config.build_predictors())
    }

    /// Use an explicit predictor list instead of the configured kinds.
    pub fn with_predictors(config: &PathTrackerConfig, predictors: Vec<Box<dyn Predictor>>) -> Result<Self> {
        ensure!(!predictors.is_empty(), "path tracker needs at least one predictor");
        let names: Vec<&str> = predictors.iter().map(|p| p.name()).collect();
        info!(
            "🧵 Path tracker: predictors={:?} floor={:.2} gap={}",
            names, config.similarity_floor, config.max_frame_gap
        );
        Ok(Self {
            params: SearchParams {
                similarity_floor: config.similarity_floor,
                max_frame_gap: config.max_frame_gap,
            },
            predictors,
        })
    }

    /// Grow a path around `seed` until no predictor finds anything more.
    pub fn track(&self, seed: Arc<DetectionBundle>, history: &BundleHistory) -> ItemPath {
        let mut path = ItemPath::new(seed);
        let max_passes = history.len() + 1;

        for pass in 0..max_passes {
            let mut grew = false;

            for direction in [Direction::Backward, Direction::Forward] {
                let Some((candidate, predictor)) = self.best_proposal(&path, history, direction) else {
                    continue;
                };
                let frame = candidate.bundle.frame_index();
                let added = match direction {
                    Direction::Backward => path.extend_backward(candidate.bundle),
                    Direction::Forward => path.extend_forward(candidate.bundle),
                };
                if added {
                    debug!(
                        "   pass {}: {} +F{} via {} (score {:.2})",
                        pass,
                        direction.as_str(),
                        frame,
                        predictor,
                        candidate.score
                    );
                    grew = true;
                }
            }

            if !grew {
                break;
            }
        }

        path
    }

    fn best_proposal(
        &self,
        path: &ItemPath,
        history: &BundleHistory,
        direction: Direction,
    ) -> Option<(Candidate, &'static str)> {
        let mut best: Option<(Candidate, &'static str)> = None;
        for predictor in &self.predictors {
            let Some(candidate) = predictor.predict(path, history, direction, &self.params) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => candidate.score > current.score,
            };
            if better {
                best = Some((candidate, predictor.name()));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::geometry::BBox;
    use crate::types::Frame;
    use image::RgbImage;

    fn bundle(index: u64, x: f32) -> Arc<DetectionBundle> {
        Arc::new(DetectionBundle::new(
            Frame::new(index, RgbImage::new(2, 2)).into_shared(),
            Detection::new("car", 0.9, BBox::new(x, 0.0, x + 20.0, 20.0)),
        ))
    }

    fn tracker() -> PathTracker {
        PathTracker::new(&PathTrackerConfig::default()).unwrap()
    }

    #[test]
    fn test_seed_without_history_is_single_bundle() {
        let history = BundleHistory::new(90).unwrap();
        let path = tracker().track(bundle(10, 0.0), &history);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_stitches_moving_object_backward() {
        let mut history = BundleHistory::new(90).unwrap();
        for (i, f) in (1..10u64).enumerate() {
            history.push(bundle(f, i as f32 * 3.0));
        }
        // Unrelated object far away
        history.push(bundle(7, 500.0));

        let path = tracker().track(bundle(10, 27.0), &history);

        assert_eq!(path.frame_indices(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_path_frames_are_non_decreasing() {
        let mut history = BundleHistory::new(90).unwrap();
        for f in [2u64, 4, 6, 12, 14] {
            history.push(bundle(f, f as f32));
        }
        let path = tracker().track(bundle(8, 8.0), &history);
        let frames = path.frame_indices();
        assert!(frames.windows(2).all(|w| w[0] <= w[1]), "{:?}", frames);
        assert_eq!(frames, vec![2, 4, 6, 8, 12, 14]);
    }

    /// Overlap predictor that records the path length it was asked about.
    struct LengthLog {
        inner: OverlapPredictor,
        lengths: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl Predictor for LengthLog {
        fn name(&self) -> &'static str {
            "length_log"
        }

        fn predict(
            &self,
            path: &ItemPath,
            history: &BundleHistory,
            direction: Direction,
            params: &SearchParams,
        ) -> Option<Candidate> {
            self.lengths.lock().unwrap().push(path.len());
            self.inner.predict(path, history, direction, params)
        }
    }

    #[test]
    fn test_path_length_never_shrinks_between_passes() {
        let mut history = BundleHistory::new(90).unwrap();
        for f in [3u64, 4, 5, 7, 8, 9] {
            history.push(bundle(f, f as f32));
        }
        let lengths = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = LengthLog {
            inner: OverlapPredictor,
            lengths: lengths.clone(),
        };
        let t = PathTracker::with_predictors(&PathTrackerConfig::default(), vec![Box::new(log)]).unwrap();

        let path = t.track(bundle(6, 6.0), &history);

        let lengths = lengths.lock().unwrap();
        assert_eq!(path.len(), 7);
        assert!(lengths.len() > 2, "several passes expected: {:?}", lengths);
        assert_eq!(lengths[0], 1);
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]), "{:?}", lengths);
        assert!(*lengths.last().unwrap() <= path.len());
    }

    #[test]
    fn test_empty_predictor_list_rejected() {
        let cfg = PathTrackerConfig {
            predictors: Vec::new(),
            ..PathTrackerConfig::default()
        };
        assert!(PathTracker::new(&cfg).is_err());
        assert!(PathTracker::with_predictors(&PathTrackerConfig::default(), Vec::new()).is_err());
    }

    #[test]
    fn test_predictor_tie_prefers_first_configured() {
        let cfg = PathTrackerConfig {
            predictors: vec![PredictorKind::Overlap, PredictorKind::Polynomial],
            ..PathTrackerConfig::default()
        };
        let t = PathTracker::new(&cfg).unwrap();
        let mut history = BundleHistory::new(90).unwrap();
        history.push(bundle(9, 0.0));
        let path = ItemPath::new(bundle(10, 0.0));
        // Single-bundle path: both predictors predict the same box.
        let (_, name) = t.best_proposal(&path, &history, Direction::Backward).unwrap();
        assert_eq!(name, "overlap");
    }
}
