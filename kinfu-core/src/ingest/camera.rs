//! Pinhole camera model.
//!
//! Camera frame convention: x to the right, y down, z forward (the optical
//! axis). Pixel `(u, v)` has its centre at integer coordinates.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics of a depth sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Nominal Kinect-class intrinsics (f = 525 px at 640x480), scaled to the
    /// requested width with the principal point at the image centre.
    pub fn kinect(cols: usize, rows: usize) -> Self {
        let f = 525.0 * cols as f32 / 640.0;
        Self::new(f, f, cols as f32 / 2.0 - 0.5, rows as f32 / 2.0 - 0.5)
    }

    /// Intrinsics of the same sensor at an image resized by `(sx, sy)`.
    /// Pixel edges, not centres, scale with the image.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: (self.cx + 0.5) * sx - 0.5,
            cy: (self.cy + 0.5) * sy - 0.5,
        }
    }

    /// Intrinsics of pyramid level `level` (each level halves the resolution).
    pub fn level(&self, level: usize) -> Self {
        let s = 1.0 / (1u32 << level) as f32;
        self.scaled(s, s)
    }

    /// Project a camera-frame point to continuous pixel coordinates.
    #[inline]
    pub fn project(&self, p: Vec3) -> Vec2 {
        Vec2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }

    /// Back-project pixel `(u, v)` at z-depth `depth`.
    #[inline]
    pub fn back_project(&self, u: f32, v: f32, depth: f32) -> Vec3 {
        self.ray(u, v) * depth
    }

    /// Ray through pixel `(u, v)` scaled to unit z (`K^-1 [u, v, 1]`).
    #[inline]
    pub fn ray(&self, u: f32, v: f32) -> Vec3 {
        Vec3::new((u - self.cx) / self.fx, (v - self.cy) / self.fy, 1.0)
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self::kinect(640, 480)
    }
}
