//! Simulated depth sensor orbiting an analytic scene.

use crate::source::{CaptureError, DepthSource, RgbdFrame};
use glam::{Affine3A, Vec3};
use kinfu_core::Intrinsics;
use kinfu_core::synthetic::{Scene, orbit_pose};
use tracing::debug;

const FPS: f64 = 30.0;

/// Renders one frame per grab while circling the orbit centre. Frames carry
/// the pose they were rendered from as ground truth.
pub struct SyntheticSource {
    scene: Scene,
    intrinsics: Intrinsics,
    resolution: (u32, u32),
    center: Vec3,
    radius: f32,
    elevation: f32,
    /// Orbit angle advanced per frame (radians).
    step: f32,
    frame_limit: Option<u64>,
    frame_number: u64,
    active: bool,
}

impl SyntheticSource {
    /// Orbit the tabletop scene at 1.2 m, half a degree per frame.
    pub fn new(intrinsics: Intrinsics, width: u32, height: u32) -> Self {
        Self {
            scene: Scene::tabletop(),
            intrinsics,
            resolution: (width, height),
            center: Vec3::new(-0.1, 0.3, 2.0),
            radius: 1.2,
            elevation: 0.4,
            step: 0.5f32.to_radians(),
            frame_limit: None,
            frame_number: 0,
            active: true,
        }
    }

    pub fn with_scene(mut self, scene: Scene) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_orbit(mut self, center: Vec3, radius: f32, elevation: f32, step: f32) -> Self {
        self.center = center;
        self.radius = radius;
        self.elevation = elevation;
        self.step = step;
        self
    }

    /// Stop after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Sensor pose of frame `frame_number`.
    pub fn pose_at(&self, frame_number: u64) -> Affine3A {
        orbit_pose(
            self.center,
            self.radius,
            self.elevation,
            self.step * frame_number as f32,
        )
    }
}

impl DepthSource for SyntheticSource {
    fn grab(&mut self) -> Result<Option<RgbdFrame>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        if self.frame_limit.is_some_and(|limit| self.frame_number >= limit) {
            self.active = false;
            return Ok(None);
        }

        let pose = self.pose_at(self.frame_number);
        let (width, height) = self.resolution;
        let depth = self
            .scene
            .render_depth(&pose, &self.intrinsics, width as usize, height as usize);

        let mut frame = RgbdFrame::new(depth, self.frame_number as f64 / FPS, self.frame_number);
        frame.ground_truth = Some(pose);
        debug!("Rendered synthetic frame {}", self.frame_number);

        self.frame_number += 1;
        if self.frame_limit.is_some_and(|limit| self.frame_number >= limit) {
            self.active = false;
        }
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
