//! Error types for the fusion core.

use thiserror::Error;

/// Errors that stop an operation of the fusion pipeline.
#[derive(Debug, Error)]
pub enum KinFuError {
    #[error("Failed to allocate TSDF volume of {voxels} voxels: {reason}")]
    VolumeAllocation { voxels: u64, reason: String },

    #[error("Frame size mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    FrameSize {
        expected_width: usize,
        expected_height: usize,
        width: usize,
        height: usize,
    },

    #[error("Buffer holds {actual} samples but a {width}x{height} map needs {expected}")]
    DataLength {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParams(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session terminated")]
    Terminated,
}

/// Reasons the pose tracker refuses to produce a pose for a frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingFailure {
    #[error("Pyramids have no common levels")]
    EmptyPyramid,

    #[error("Only {found} correspondences at level {level} (need {required})")]
    TooFewCorrespondences {
        level: usize,
        found: usize,
        required: usize,
    },

    #[error("Ill-conditioned system at level {level} (condition number {condition:.3e})")]
    IllConditioned { level: usize, condition: f64 },

    #[error("Non-finite pose increment at level {level}")]
    NonFinite { level: usize },

    #[error("Residual {rms:.4} m exceeds limit {limit:.4} m")]
    ResidualTooLarge { rms: f32, limit: f32 },
}
