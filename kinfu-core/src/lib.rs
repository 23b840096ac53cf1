//! KinFu Core Crate
//!
//! Real-time dense reconstruction from depth frames: every frame is
//! preprocessed into a point/normal pyramid, aligned against a ray-cast view
//! of the accumulated model with projective ICP, and fused into a truncated
//! signed distance volume.
//!
//! ## Modules
//!
//! - [`ingest`]: camera intrinsics, depth frames and the preprocessing pyramid
//! - [`scene`]: the TSDF volume and the ray caster that renders it
//! - [`reconstruction`]: pose tracking and the per-frame fusion pipeline
//! - [`render`]: image synthesis from ray casts and raw depth
//! - [`synthetic`]: analytic scenes for tests and simulated sensors

pub mod error;
pub mod ingest;
pub mod params;
pub mod reconstruction;
pub mod render;
pub mod scene;
pub mod synthetic;

pub use error::{KinFuError, TrackingFailure};
pub use ingest::{
    DepthFrame, DepthMap, Intrinsics, Map2D, NormalMap, PointMap, Preprocessor, Pyramid, PyramidLevel,
};
pub use params::{KinFuParams, PoseConfig};
pub use reconstruction::{
    FrameStatus, KinFu, PoseTracker, Session, TrackingResult, TrackingState, TrackingStats,
};
pub use render::{RenderMode, depth_preview, render_raycast};
pub use scene::{Extraction, RayCaster, Raycast, TsdfVolume, Voxel};
