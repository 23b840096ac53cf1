//! Data ingestion module
//!
//! Everything between the sensor and the tracker:
//! - Pinhole intrinsics and the camera frame convention
//! - Raw and metric depth maps
//! - Bilateral filtering and the point/normal pyramid

pub mod camera;
pub mod depth;
pub mod pyramid;

pub use camera::Intrinsics;
pub use depth::{DepthFrame, DepthMap, Map2D, NormalMap, PointMap};
pub use pyramid::{Preprocessor, Pyramid, PyramidLevel};
