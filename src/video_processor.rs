// src/video_processor.rs
//
// Frame sources. The pipeline only needs frames in strictly increasing index
// order and an end-of-stream signal (`Ok(None)`).

use crate::types::{Frame, SourceConfig};
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decoded still images from a directory, in file-name order, optionally
/// paired with same-named foreground masks from a second directory.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    masks_dir: Option<PathBuf>,
    source_id: String,
    fps: f32,
    cursor: usize,
    next_index: u64,
}

impl ImageSequenceSource {
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let dir = Path::new(&config.frames_dir);
        if !dir.is_dir() {
            bail!("Frame directory not found: {}", dir.display());
        }

        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        if files.is_empty() {
            warn!("No frames found in {}", dir.display());
        } else {
            info!("Found {} frames in {}", files.len(), dir.display());
        }

        let masks_dir = config.masks_dir.as_ref().map(PathBuf::from);
        if let Some(masks) = &masks_dir {
            if !masks.is_dir() {
                bail!("Mask directory not found: {}", masks.display());
            }
        }

        Ok(Self {
            files,
            masks_dir,
            source_id: config.source_id.clone(),
            fps: if config.fps > 0.0 { config.fps } else { 30.0 },
            cursor: 0,
            next_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn mask_for(&self, frame_path: &Path) -> Option<PathBuf> {
        let masks = self.masks_dir.as_ref()?;
        let same_name = masks.join(frame_path.file_name()?);
        if same_name.is_file() {
            return Some(same_name);
        }
        let png = masks.join(frame_path.file_stem()?).with_extension("png");
        png.is_file().then_some(png)
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        while self.cursor < self.files.len() {
            let file_index = self.cursor as u64;
            let path = self.files[self.cursor].clone();
            self.cursor += 1;

            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    warn!("⚠️  Skipping undecodable frame {}: {}", path.display(), e);
                    continue;
                }
            };

            let index = self.next_index;
            self.next_index += 1;
            let timestamp_ms = index as f64 * 1000.0 / self.fps as f64;

            let mut frame = Frame::new(index, image)
                .with_source(self.source_id.clone(), file_index)
                .with_timing(timestamp_ms, self.fps);
            // Every still image is its own keyframe.
            frame.keyframe_index = index;

            if let Some(mask_path) = self.mask_for(&path) {
                match image::open(&mask_path) {
                    Ok(mask) => {
                        let mask = mask.to_luma8();
                        if mask.dimensions() == frame.image.dimensions() {
                            frame = frame.with_foreground(mask);
                        } else {
                            warn!(
                                "⚠️  Mask {} is {:?}, frame is {:?}; ignoring",
                                mask_path.display(),
                                mask.dimensions(),
                                frame.image.dimensions()
                            );
                        }
                    }
                    Err(e) => warn!("⚠️  Unreadable mask {}: {}", mask_path.display(), e),
                }
            }

            debug!("🎞️  F{} ← {}", index, path.display());
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    #[test]
    fn test_sequence_order_masks_and_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        let masks = dir.path().join("masks");
        std::fs::create_dir_all(&frames).unwrap();
        std::fs::create_dir_all(&masks).unwrap();

        for name in ["b.png", "a.png"] {
            RgbImage::new(8, 6).save(frames.join(name)).unwrap();
        }
        std::fs::write(frames.join("notes.txt"), "ignored").unwrap();
        GrayImage::from_pixel(8, 6, Luma([255])).save(masks.join("a.png")).unwrap();

        let config = SourceConfig {
            frames_dir: frames.to_string_lossy().into_owned(),
            masks_dir: Some(masks.to_string_lossy().into_owned()),
            source_id: "cam-7".to_string(),
            fps: 10.0,
        };
        let mut source = ImageSequenceSource::open(&config).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.source_id, "cam-7");
        assert!(first.foreground.is_some(), "a.png has a mask");

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.timestamp_ms, 100.0);
        assert!(second.foreground.is_none());

        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let config = SourceConfig {
            frames_dir: "/definitely/not/here".to_string(),
            ..SourceConfig::default()
        };
        assert!(ImageSequenceSource::open(&config).is_err());
    }
}
