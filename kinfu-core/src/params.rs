//! Pipeline configuration.
//!
//! Every threshold of the pipeline lives here with its documented default.
//! The struct is serde-friendly so applications can load overrides from JSON;
//! fields missing from the file keep their defaults.

use crate::error::KinFuError;
use crate::ingest::Intrinsics;
use glam::{Affine3A, Quat, UVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rigid transform in a serializable form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl PoseConfig {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn affine(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation.normalize(), self.translation)
    }
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self::from_translation(Vec3::ZERO)
    }
}

impl From<Affine3A> for PoseConfig {
    fn from(pose: Affine3A) -> Self {
        let (_, rotation, translation) = pose.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinFuParams {
    /// Depth frame width in pixels.
    pub cols: usize,
    /// Depth frame height in pixels.
    pub rows: usize,
    pub intrinsics: Intrinsics,

    /// Voxel counts along each axis.
    pub volume_dims: UVec3,
    /// Physical extent of the volume (meters).
    pub volume_size: Vec3,
    /// Volume-local to world transform.
    pub volume_pose: PoseConfig,
    /// Sensor pose used for the first frame.
    pub initial_pose: PoseConfig,

    pub bilateral_kernel_size: usize,
    /// Spatial sigma of the bilateral filter (pixels).
    pub bilateral_sigma_spatial: f32,
    /// Range sigma of the bilateral filter (meters).
    pub bilateral_sigma_depth: f32,
    /// Depths outside `[min_depth, max_depth]` are discarded (meters).
    pub min_depth: f32,
    pub max_depth: f32,

    /// Gauss-Newton iterations per pyramid level, finest level first.
    /// The length sets the number of pyramid levels.
    pub icp_iterations: Vec<u32>,
    /// Correspondences farther apart are rejected (meters).
    pub icp_dist_threshold: f32,
    /// Correspondences whose normals differ more are rejected (radians).
    pub icp_angle_threshold: f32,
    pub icp_min_correspondences: usize,
    /// Largest accepted condition number of the 6x6 normal system.
    pub icp_max_condition: f64,
    /// Largest accepted RMS point-to-plane residual at the finest level (meters).
    pub icp_max_rms: f32,

    /// Truncation distance of the signed distance field (meters).
    pub tsdf_trunc_dist: f32,
    /// Voxel weights saturate at this value.
    pub tsdf_max_weight: f32,
    /// Frames whose motion (mean of rotation angle and translation) is below
    /// this value are tracked but not integrated.
    pub tsdf_min_camera_movement: f32,

    /// Ray marching step in voxel sizes.
    pub raycast_step_factor: f32,
    /// Finite difference step for TSDF gradients in voxel sizes.
    pub gradient_delta_factor: f32,

    /// Light position for shaded renders (world space).
    pub light_position: Vec3,
}

impl KinFuParams {
    /// Defaults for a 640x480 structured-light sensor and a 3 m cube of 512^3 voxels.
    pub fn default_params() -> Self {
        let cols = 640;
        let rows = 480;
        let volume_size = Vec3::splat(3.0);

        Self {
            cols,
            rows,
            intrinsics: Intrinsics::kinect(cols, rows),
            volume_dims: UVec3::splat(512),
            volume_size,
            volume_pose: PoseConfig::from_translation(Vec3::new(
                -volume_size.x / 2.0,
                -volume_size.y / 2.0,
                0.5,
            )),
            initial_pose: PoseConfig::default(),
            bilateral_kernel_size: 7,
            bilateral_sigma_spatial: 4.5,
            bilateral_sigma_depth: 0.04,
            min_depth: 0.3,
            max_depth: 4.0,
            icp_iterations: vec![10, 5, 4],
            icp_dist_threshold: 0.1,
            icp_angle_threshold: 30f32.to_radians(),
            icp_min_correspondences: 64,
            icp_max_condition: 1e6,
            icp_max_rms: 0.05,
            tsdf_trunc_dist: 0.04,
            tsdf_max_weight: 64.0,
            tsdf_min_camera_movement: 0.0,
            raycast_step_factor: 0.75,
            gradient_delta_factor: 0.5,
            light_position: Vec3::ZERO,
        }
    }

    /// Load parameters from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, KinFuError> {
        let text = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn pyramid_levels(&self) -> usize {
        self.icp_iterations.len()
    }

    pub fn voxel_size(&self) -> Vec3 {
        self.volume_size / self.volume_dims.as_vec3()
    }

    /// Reject parameter combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), KinFuError> {
        let fail = |msg: String| Err(KinFuError::InvalidParams(msg));

        if self.cols == 0 || self.rows == 0 {
            return fail(format!("frame size {}x{} is empty", self.cols, self.rows));
        }
        if self.intrinsics.fx <= 0.0 || self.intrinsics.fy <= 0.0 {
            return fail("focal lengths must be positive".into());
        }
        if self.volume_dims.min_element() < 2 {
            return fail(format!("volume dims {} need at least 2 voxels per axis", self.volume_dims));
        }
        if self.volume_size.min_element() <= 0.0 {
            return fail(format!("volume size {} must be positive", self.volume_size));
        }
        if self.icp_iterations.is_empty() {
            return fail("icp_iterations needs at least one level".into());
        }
        let coarsest = 1usize << (self.icp_iterations.len() - 1);
        if self.cols / coarsest < 2 || self.rows / coarsest < 2 {
            return fail(format!(
                "{} pyramid levels are too many for a {}x{} frame",
                self.icp_iterations.len(),
                self.cols,
                self.rows
            ));
        }
        if !(self.min_depth >= 0.0 && self.max_depth > self.min_depth) {
            return fail(format!("depth range [{}, {}] is empty", self.min_depth, self.max_depth));
        }
        if self.tsdf_trunc_dist <= 0.0 {
            return fail("tsdf_trunc_dist must be positive".into());
        }
        if self.tsdf_max_weight < 1.0 {
            return fail("tsdf_max_weight must be at least 1".into());
        }
        if self.raycast_step_factor <= 0.0 || self.gradient_delta_factor <= 0.0 {
            return fail("raycast step and gradient delta must be positive".into());
        }
        if self.bilateral_sigma_spatial <= 0.0 || self.bilateral_sigma_depth <= 0.0 {
            return fail("bilateral sigmas must be positive".into());
        }
        Ok(())
    }
}

impl Default for KinFuParams {
    fn default() -> Self {
        Self::default_params()
    }
}
