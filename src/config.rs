// src/config.rs

use crate::types::Config;
use anyhow::{ensure, Context, Result};
use std::collections::HashSet;
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path))?;
        Ok(config)
    }

    /// Reject anything that would make the run meaningless before a single
    /// frame is read.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.history.frame_capacity > 0,
            "history.frame_capacity must be > 0"
        );
        ensure!(
            self.history.bundle_window > 0,
            "history.bundle_window must be > 0"
        );

        self.cascade.validate()?;
        ensure!(
            self.cascade.search_range <= self.history.frame_capacity,
            "cascade.search_range ({}) exceeds history.frame_capacity ({})",
            self.cascade.search_range,
            self.history.frame_capacity
        );

        let mut names = HashSet::new();
        for lane in &self.lanes {
            lane.validate()?;
            ensure!(names.insert(lane.name.as_str()), "duplicate lane name '{}'", lane.name);
        }

        self.tracker.validate()?;

        ensure!(self.source.fps > 0.0, "source.fps must be > 0");
        ensure!(self.sink.queue_size > 0, "sink.queue_size must be > 0");
        ensure!(
            (1..=100).contains(&self.detectors.jpeg_quality),
            "detectors.jpeg_quality must be in 1..=100"
        );
        ensure!(
            (1..=100).contains(&self.sink.snapshot_quality),
            "sink.snapshot_quality must be in 1..=100"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
history:
  frame_capacity: 150
cascade:
  search_range: 8
  categories: [car, person]
lanes:
  - name: North
    line: { start: [0, 240], end: [640, 240] }
    threshold: 0.5
    hysteresis: 0.0
    min_run: 2
  - name: South
    line: { start: [0, 400], end: [640, 400] }
tracker:
  predictors: [overlap]
detectors:
  cheap_url: http://localhost:8001/detect
  heavy_url: http://localhost:8002/detect
"#;

    fn write(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_partial_file_loads_with_defaults() {
        let f = write(SAMPLE);
        let config = Config::load(f.path().to_str().unwrap()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.history.frame_capacity, 150);
        assert_eq!(config.history.bundle_window, 90);
        assert_eq!(config.cascade.search_range, 8);
        assert_eq!(config.cascade.escalation_confidence, 0.6);
        assert_eq!(config.lanes.len(), 2);
        assert_eq!(config.lanes[0].trigger.min_run, 2);
        assert_eq!(config.lanes[1].trigger.min_run, 1);
        assert_eq!(config.lanes[1].samples, 64);
        assert_eq!(config.tracker.predictors.len(), 1);
        assert_eq!(config.sink.jsonl_path.as_deref(), Some("traces.jsonl"));
        assert_eq!(config.detectors.jpeg_quality, 80);
    }

    #[test]
    fn test_negative_hysteresis_rejected() {
        let f = write(
            r#"
lanes:
  - name: North
    line: { start: [0, 10], end: [10, 10] }
    hysteresis: -1.0
"#,
        );
        let config = Config::load(f.path().to_str().unwrap()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_lane_and_range_checks() {
        let mut config = Config::default();
        let lane = crate::pipeline::stages::LaneConfig {
            name: "North".to_string(),
            line: crate::geometry::Segment::new([0.0, 0.0], [10.0, 0.0]),
            ..Default::default()
        };
        config.lanes = vec![lane.clone(), lane];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cascade.search_range = config.history.frame_capacity + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.history.frame_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detectors.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/no/such/config.yaml").is_err());
    }
}
