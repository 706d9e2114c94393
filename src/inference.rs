// src/inference.rs
//
// Detector collaborator contract. The cascade only ever sees `dyn Detector`;
// which backend answers (a local model server, a cloud endpoint, a scripted
// test double) is decided at startup.

use crate::detection::Detection;
use crate::geometry::{BBox, Segment};
use crate::types::Frame;
use anyhow::{bail, Context, Result};
use base64::Engine;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller wants the detector to look for.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectRequest {
    /// Accepted class labels; empty accepts everything
    pub categories: Vec<String>,
    /// Only boxes crossing this segment are of interest
    pub trigger_line: Option<Segment>,
    /// Minimum segment/box overlap ratio for `trigger_line`
    pub min_overlap: Option<f32>,
    /// Restrict the search to this region of the frame
    pub region: Option<BBox>,
}

impl DetectRequest {
    pub fn accepts_label(&self, label: &str) -> bool {
        self.categories.is_empty() || self.categories.iter().any(|c| c == label)
    }
}

pub trait Detector: Send {
    fn name(&self) -> &str;

    /// Run on one frame. An `Err` means "no usable result" to the caller.
    fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<Detection>>;
}

// ============================================================================
// HTTP DETECTOR
// ============================================================================

#[derive(Debug, Serialize)]
struct DetectPayload<'a> {
    frame_index: u64,
    source_id: &'a str,
    timestamp_ms: f64,
    width: u32,
    height: u32,
    image_base64: String,
    request: &'a DetectRequest,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    label: String,
    confidence: f32,
    /// [x1, y1, x2, y2] in pixels
    bbox: [f32; 4],
}

/// Posts each frame as a base64 JPEG to an inference server and parses the
/// returned boxes. Blocking: the frame loop waits for the answer.
pub struct HttpDetector {
    name: String,
    client: reqwest::blocking::Client,
    endpoint: String,
    jpeg_quality: u8,
}

impl HttpDetector {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let name = name.into();
        let endpoint = endpoint.into();
        info!("🔌 Detector '{}' → {}", name, endpoint);
        Ok(Self {
            name,
            client,
            endpoint,
            jpeg_quality: 80,
        })
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

impl Detector for HttpDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<Detection>> {
        let jpeg = encode_jpeg(&frame.image, self.jpeg_quality)?;
        let payload = DetectPayload {
            frame_index: frame.index,
            source_id: &frame.source_id,
            timestamp_ms: frame.timestamp_ms,
            width: frame.width(),
            height: frame.height(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
            request,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .with_context(|| format!("{}: request for F{} failed", self.name, frame.index))?;

        if !response.status().is_success() {
            bail!("{}: server returned {} for F{}", self.name, response.status(), frame.index);
        }

        let parsed: DetectResponse = response
            .json()
            .with_context(|| format!("{}: malformed response for F{}", self.name, frame.index))?;

        let mut detections = Vec::with_capacity(parsed.detections.len());
        for raw in parsed.detections {
            let [x1, y1, x2, y2] = raw.bbox;
            let bbox = BBox::new(x1, y1, x2, y2);
            if !bbox.is_finite() || !raw.confidence.is_finite() {
                warn!("{}: dropping non-finite box on F{}", self.name, frame.index);
                continue;
            }
            detections.push(Detection::new(raw.label, raw.confidence, bbox));
        }

        debug!("{}: F{} → {} boxes", self.name, frame.index, detections.len());
        Ok(detections)
    }
}

// ============================================================================
// JPEG ENCODING HELPER
// ============================================================================

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .context("JPEG encoding failed")?;
    Ok(buf.into_inner())
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    /// Returns canned detections per frame index and records every call.
    #[derive(Clone, Default)]
    pub struct ScriptedDetector {
        pub hits: HashMap<u64, Vec<Detection>>,
        pub failing: HashSet<u64>,
        pub calls: Arc<Mutex<Vec<u64>>>,
        pub requests: Arc<Mutex<Vec<DetectRequest>>>,
    }

    impl ScriptedDetector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn hit(mut self, frame_index: u64, detection: Detection) -> Self {
            self.hits.entry(frame_index).or_default().push(detection);
            self
        }

        pub fn fail_on(mut self, frame_index: u64) -> Self {
            self.failing.insert(frame_index);
            self
        }

        pub fn call_log(&self) -> Arc<Mutex<Vec<u64>>> {
            self.calls.clone()
        }
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn detect(&mut self, frame: &Frame, request: &DetectRequest) -> Result<Vec<Detection>> {
            self.calls.lock().unwrap().push(frame.index);
            self.requests.lock().unwrap().push(request.clone());
            if self.failing.contains(&frame.index) {
                bail!("scripted failure on F{}", frame.index);
            }
            Ok(self.hits.get(&frame.index).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_category_filter_accepts_everything() {
        let open = DetectRequest::default();
        assert!(open.accepts_label("car"));

        let narrow = DetectRequest {
            categories: vec!["person".to_string()],
            ..Default::default()
        };
        assert!(narrow.accepts_label("person"));
        assert!(!narrow.accepts_label("car"));
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([120, 30, 200]));
        let bytes = encode_jpeg(&img, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_jpeg_quality_is_clamped() {
        let detector = HttpDetector::new("cheap", "http://localhost:1/detect", 1)
            .unwrap()
            .with_jpeg_quality(0);
        assert_eq!(detector.jpeg_quality, 1);
        let detector = detector.with_jpeg_quality(60);
        assert_eq!(detector.jpeg_quality, 60);
    }

    #[test]
    fn test_response_parsing_tolerates_missing_list() {
        let parsed: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.detections.is_empty());

        let parsed: DetectResponse = serde_json::from_str(
            r#"{"detections":[{"label":"car","confidence":0.7,"bbox":[1,2,3,4]}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.detections[0].bbox, [1.0, 2.0, 3.0, 4.0]);
    }
}
