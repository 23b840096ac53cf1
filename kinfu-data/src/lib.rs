//! KinFu Data Crate
//!
//! CPU-side geometry produced by the fusion pipeline: point/normal clouds
//! extracted from the TSDF volume, triangle meshes reconstructed from those
//! clouds, and PLY persistence for both.

pub mod ply;
pub mod triangulation;
pub mod types;

pub use ply::{PlyError, load_cloud_from_ply, ply_has_faces, write_cloud_ply, write_mesh_ply};
pub use triangulation::{MeshParams, ProjectionPlane, reconstruct_mesh, triangulate_points};
pub use types::{Mesh, Point, PointCloud, Triangle};
