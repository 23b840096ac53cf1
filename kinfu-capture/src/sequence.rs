//! Recorded RGB-D sequences.
//!
//! Layout: `<root>/depth/*.png` holds 16-bit depth images and the optional
//! `<root>/rgb/*.png` the color images, matched by sorted position. File
//! stems that parse as numbers (TUM style, `1305031102.175304.png`) are used
//! as timestamps. Depth images that fail to decode are skipped with a
//! warning.

use crate::source::{CaptureError, DepthSource, RgbdFrame};
use image::{ImageReader, Luma};
use kinfu_core::{DepthFrame, Intrinsics};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Depth units per metre in TUM RGB-D recordings.
pub const TUM_DEPTH_SCALE: f32 = 5000.0;

const FALLBACK_FPS: f64 = 30.0;

pub struct ImageSequenceSource {
    root: PathBuf,
    depth_files: Vec<PathBuf>,
    color_files: Vec<PathBuf>,
    intrinsics: Intrinsics,
    resolution: (u32, u32),
    /// Raw depth units per metre.
    depth_scale: f32,
    first_timestamp: Option<f64>,
    next: usize,
    active: bool,
}

fn sorted_pngs(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn stem_timestamp(path: &Path) -> Option<f64> {
    path.file_stem()?.to_str()?.parse().ok()
}

impl ImageSequenceSource {
    /// Open a sequence directory. Depth defaults to the TUM scale of 5000 units per metre.
    pub fn open(root: impl AsRef<Path>, intrinsics: Intrinsics) -> Result<Self, CaptureError> {
        let root = root.as_ref().to_path_buf();
        let depth_dir = root.join("depth");
        if !depth_dir.is_dir() {
            return Err(CaptureError::NotFound(depth_dir));
        }

        let depth_files = sorted_pngs(&depth_dir)?;
        let Some(first) = depth_files.first() else {
            return Err(CaptureError::EmptySequence(depth_dir));
        };
        let resolution = image::image_dimensions(first)?;

        let rgb_dir = root.join("rgb");
        let color_files = if rgb_dir.is_dir() {
            sorted_pngs(&rgb_dir)?
        } else {
            Vec::new()
        };
        if !color_files.is_empty() && color_files.len() != depth_files.len() {
            warn!(
                "{} color images for {} depth images, color is matched by position",
                color_files.len(),
                depth_files.len()
            );
        }

        info!(
            "Opened sequence {}: {} frames at {}x{}",
            root.display(),
            depth_files.len(),
            resolution.0,
            resolution.1
        );

        Ok(Self {
            root,
            depth_files,
            color_files,
            intrinsics,
            resolution,
            depth_scale: TUM_DEPTH_SCALE,
            first_timestamp: None,
            next: 0,
            active: true,
        })
    }

    /// Set the number of raw depth units per metre (1000 for millimetre data).
    pub fn with_depth_scale(mut self, units_per_meter: f32) -> Self {
        self.depth_scale = units_per_meter;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.depth_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth_files.is_empty()
    }

    fn read_depth(&self, path: &Path) -> Result<DepthFrame, CaptureError> {
        let decoded = ImageReader::open(path)?.decode()?;
        let (width, height) = (decoded.width(), decoded.height());
        if (width, height) != self.resolution {
            return Err(CaptureError::ResolutionChanged {
                path: path.to_path_buf(),
                width,
                height,
                expected_width: self.resolution.0,
                expected_height: self.resolution.1,
            });
        }
        if decoded.color().channel_count() != 1 {
            return Err(CaptureError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: format!("expected single-channel depth, got {:?}", decoded.color()),
            });
        }

        let to_mm = 1000.0 / self.depth_scale;
        let raw = decoded.into_luma16();
        let data = raw
            .pixels()
            .map(|Luma([v])| (*v as f32 * to_mm).round().min(u16::MAX as f32) as u16)
            .collect();
        Ok(DepthFrame::new(width as usize, height as usize, data)?)
    }
}

impl DepthSource for ImageSequenceSource {
    fn grab(&mut self) -> Result<Option<RgbdFrame>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        let Some(path) = self.depth_files.get(self.next).cloned() else {
            self.active = false;
            info!("Sequence {} finished", self.root.display());
            return Ok(None);
        };

        let index = self.next;
        self.next += 1;
        if self.next >= self.depth_files.len() {
            self.active = false;
        }

        let depth = match self.read_depth(&path) {
            Ok(depth) => depth,
            Err(e) => {
                warn!("Skipping depth image {}: {}", path.display(), e);
                return Ok(None);
            }
        };
        let timestamp = match stem_timestamp(&path) {
            Some(t) => t - *self.first_timestamp.get_or_insert(t),
            None => index as f64 / FALLBACK_FPS,
        };

        let mut frame = RgbdFrame::new(depth, timestamp, index as u64);
        if let Some(color_path) = self.color_files.get(index) {
            match image::open(color_path) {
                Ok(color) => frame = frame.with_color(color.into_rgb8()),
                Err(e) => warn!("Skipping color image {}: {}", color_path.display(), e),
            }
        }

        debug!("Read frame {} from {}", index, path.display());
        Ok(Some(frame))
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        self.active = false;
    }
}
