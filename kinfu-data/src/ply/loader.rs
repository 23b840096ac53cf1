//! PLY file loading functions

use crate::ply::PlyError;
use crate::types::{Point, PointCloud};
use glam::Vec3;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

// Face structure for PLY files
#[derive(Deserialize, Debug)]
#[allow(dead_code)]
struct PlyFace {
    vertex_indices: Vec<i32>,
}

// PLY file structure
#[derive(Deserialize, Debug)]
struct PlyFile {
    #[serde(rename = "vertex")]
    vertex: Vec<HashMap<String, JsonValue>>,
    #[serde(default, rename = "face", skip_serializing_if = "Vec::is_empty")]
    face: Vec<PlyFace>,
}

fn parse_ply(path: &Path) -> Result<PlyFile, PlyError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    serde_ply::from_reader(reader).map_err(|e| {
        warn!("Failed to parse PLY file: {}", e);
        PlyError::Parse(e.to_string())
    })
}

fn get_f32(prop: Option<&JsonValue>) -> Option<f32> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64().map(|f| f as f32),
        _ => None,
    })
}

fn get_u8(prop: Option<&JsonValue>) -> Option<u8> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n
            .as_u64()
            .map(|u| u as u8)
            .or_else(|| n.as_i64().map(|i| i as u8)),
        _ => None,
    })
}

/// Load a point cloud (positions, optional normals and colors) from a PLY file.
///
/// Reads `x/y/z`, `nx/ny/nz` when present and `red/green/blue` or `r/g/b`
/// colors. Points without color come back light gray.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_cloud_from_ply(path: impl AsRef<Path>) -> Result<PointCloud, PlyError> {
    let path = path.as_ref();
    debug!("Loading PLY cloud from: {}", path.display());
    let ply_data = parse_ply(path)?;

    info!(
        "PLY file parsed: {} vertices, {} faces",
        ply_data.vertex.len(),
        ply_data.face.len()
    );

    let mut points = Vec::with_capacity(ply_data.vertex.len());

    for (index, vertex) in ply_data.vertex.iter().enumerate() {
        let coord = |property: &'static str| {
            get_f32(vertex.get(property)).ok_or(PlyError::MissingProperty { property, index })
        };
        let position = Vec3::new(coord("x")?, coord("y")?, coord("z")?);

        let normal = match (
            get_f32(vertex.get("nx")),
            get_f32(vertex.get("ny")),
            get_f32(vertex.get("nz")),
        ) {
            (Some(x), Some(y), Some(z)) => Some(Vec3::new(x, y, z)),
            _ => None,
        };

        let color = if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("red")),
            get_u8(vertex.get("green")),
            get_u8(vertex.get("blue")),
        ) {
            Vec3::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
        } else if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("r")),
            get_u8(vertex.get("g")),
            get_u8(vertex.get("b")),
        ) {
            Vec3::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
        } else {
            Vec3::splat(0.8)
        };

        points.push(Point {
            position,
            normal,
            color,
        });
    }

    debug!("Loaded {} points from PLY file", points.len());
    Ok(PointCloud::new(points))
}

/// Check if a PLY file contains face data.
pub fn ply_has_faces(path: impl AsRef<Path>) -> Result<bool, PlyError> {
    let ply_data = parse_ply(path.as_ref())?;
    Ok(!ply_data.face.is_empty())
}
