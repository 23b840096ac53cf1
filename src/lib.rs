//! KinFu
//!
//! Real-time dense surface reconstruction from a depth sensor stream.
//! This facade re-exports the workspace crates:
//!
//! - [`data`]: points, clouds, meshes and PLY persistence
//! - [`fusion`]: preprocessing, TSDF volume, ray casting, ICP and the fusion pipeline
//! - [`capture`]: depth sources (image sequences, synthetic orbits)

pub use kinfu_capture as capture;
pub use kinfu_core as fusion;
pub use kinfu_data as data;

pub use kinfu_core::{FrameStatus, KinFu, KinFuError, KinFuParams};
