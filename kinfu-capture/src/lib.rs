//! KinFu Capture - Depth frame sources
//!
//! This crate provides implementations of the [`DepthSource`] trait that
//! feed the fusion pipeline:
//!
//! - Recorded RGB-D sequences stored as 16-bit PNG files
//! - A simulated sensor orbiting an analytic scene
//!
//! ## Example
//!
//! ```ignore
//! use kinfu_capture::{DepthSource, ImageSequenceSource};
//! use kinfu_core::{Intrinsics, KinFu, KinFuParams};
//!
//! let mut source = ImageSequenceSource::open("data/rgbd_dataset", Intrinsics::kinect(640, 480))?;
//! let mut kinfu = KinFu::new(KinFuParams::default_params())?;
//! while source.is_active() {
//!     if let Some(frame) = source.grab()? {
//!         kinfu.step_frame(&frame.depth)?;
//!     }
//! }
//! ```

mod sequence;
mod source;
mod synthetic;

pub use sequence::{ImageSequenceSource, TUM_DEPTH_SCALE};
pub use source::{CaptureError, DepthSource, RgbdFrame};
pub use synthetic::SyntheticSource;
