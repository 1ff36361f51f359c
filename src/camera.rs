use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;

use crate::config::CaptureConfig;
use crate::traits::{Camera, CameraSettings};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Camera backed by a still image on disk. Without an image configured it
/// returns a small placeholder JPEG stream tagged with the frame number.
pub struct FileCamera {
    path: Option<PathBuf>,
    settings: CameraSettings,
    frames: u64,
}

impl FileCamera {
    pub fn new(config: &CaptureConfig) -> Self {
        FileCamera {
            path: config.image_path.as_ref().map(PathBuf::from),
            settings: CameraSettings {
                resolution: config.resolution.clone(),
                jpeg_quality: config.jpeg_quality,
            },
            frames: 0,
        }
    }
}

impl Camera for FileCamera {
    fn capture_now(&mut self) -> Result<Vec<u8>> {
        self.frames += 1;

        let frame = match &self.path {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read frame source {}", path.display()))?,
            None => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&JPEG_SOI);
                buf.extend_from_slice(&self.frames.to_be_bytes());
                buf.extend_from_slice(&JPEG_EOI);
                buf
            }
        };

        debug!("Frame {}: {} bytes", self.frames, frame.len());
        Ok(frame)
    }

    fn settings(&self) -> CameraSettings {
        self.settings.clone()
    }
}
