//! Real-time reconstruction
//!
//! Pose tracking against the model and the per-frame pipeline that ties
//! preprocessing, tracking, fusion and ray casting together.

pub mod icp;
pub mod pipeline;

pub use icp::{PoseTracker, TrackingResult, TrackingStats};
pub use pipeline::{FrameStatus, KinFu, Session, TrackingState};
