//! PLY import and export

mod error;
mod loader;
mod writer;

pub use error::PlyError;
pub use loader::{load_cloud_from_ply, ply_has_faces};
pub use writer::{write_cloud_ply, write_mesh_ply};
