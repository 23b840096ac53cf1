//! Volumetric scene model
//!
//! The TSDF volume that accumulates depth frames, and the ray caster that
//! renders it back into depth, point and normal maps.

pub mod raycast;
pub mod volume;

pub use raycast::{RayCaster, Raycast};
pub use volume::{Extraction, TsdfVolume, Voxel};
