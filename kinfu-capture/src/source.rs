//! Common depth source types and traits.

use glam::Affine3A;
use image::RgbImage;
use kinfu_core::{DepthFrame, Intrinsics, KinFuError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Sequence not found: {0}")]
    NotFound(PathBuf),

    #[error("No depth images in {0}")]
    EmptySequence(PathBuf),

    #[error("Unsupported format in {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Frame {path} is {width}x{height}, sequence is {expected_width}x{expected_height}")]
    ResolutionChanged {
        path: PathBuf,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Frame error: {0}")]
    Frame(#[from] KinFuError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One depth frame with optional color.
#[derive(Debug, Clone)]
pub struct RgbdFrame {
    /// Depth in millimetres, 0 = no reading.
    pub depth: DepthFrame,
    /// Registered color image, when the source has one.
    pub color: Option<RgbImage>,
    /// Seconds since the start of the stream.
    pub timestamp: f64,
    pub frame_number: u64,
    /// Sensor pose the frame was taken from, for simulated sources.
    pub ground_truth: Option<Affine3A>,
}

impl RgbdFrame {
    pub fn new(depth: DepthFrame, timestamp: f64, frame_number: u64) -> Self {
        Self {
            depth,
            color: None,
            timestamp,
            frame_number,
            ground_truth: None,
        }
    }

    pub fn with_color(mut self, color: RgbImage) -> Self {
        self.color = Some(color);
        self
    }

    /// Frame dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.depth.width() as u32, self.depth.height() as u32)
    }
}

/// Trait for sources that provide depth frames.
pub trait DepthSource {
    /// Get the next frame. `Ok(None)` means no frame is available right now;
    /// check [`DepthSource::is_active`] to tell a pause from the end.
    fn grab(&mut self) -> Result<Option<RgbdFrame>, CaptureError>;

    /// Pinhole intrinsics of the depth camera.
    fn intrinsics(&self) -> Intrinsics;

    /// Get the resolution (width, height).
    fn resolution(&self) -> (u32, u32);

    /// Check if the source can still produce frames.
    fn is_active(&self) -> bool;

    /// Stop capturing.
    fn stop(&mut self);
}

impl<S: DepthSource + ?Sized> DepthSource for Box<S> {
    fn grab(&mut self) -> Result<Option<RgbdFrame>, CaptureError> {
        (**self).grab()
    }

    fn intrinsics(&self) -> Intrinsics {
        (**self).intrinsics()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}
