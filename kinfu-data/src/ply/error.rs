//! Errors raised while reading or writing PLY files.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PLY parsing error: {0}")]
    Parse(String),

    #[error("Missing '{property}' at vertex {index}")]
    MissingProperty { property: &'static str, index: usize },

    #[error("Face {face} references vertex {vertex} but the mesh has {vertex_count} vertices")]
    InvalidFace {
        face: usize,
        vertex: u32,
        vertex_count: usize,
    },
}
