//! Binary PLY export for extracted clouds and reconstructed meshes.
//!
//! Records are written in native byte order and the header names that
//! order, so the files stay readable on either endianness.

use crate::ply::PlyError;
use crate::types::{Mesh, PointCloud};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

const FORMAT: &str = if cfg!(target_endian = "little") {
    "binary_little_endian"
} else {
    "binary_big_endian"
};

fn write_header<W: Write>(
    out: &mut W,
    vertex_count: usize,
    with_normals: bool,
    face_count: Option<usize>,
) -> std::io::Result<()> {
    writeln!(out, "ply")?;
    writeln!(out, "format {FORMAT} 1.0")?;
    writeln!(out, "comment generated by kinfu")?;
    writeln!(out, "element vertex {vertex_count}")?;
    for axis in ["x", "y", "z"] {
        writeln!(out, "property float {axis}")?;
    }
    if with_normals {
        for axis in ["nx", "ny", "nz"] {
            writeln!(out, "property float {axis}")?;
        }
    }
    if let Some(faces) = face_count {
        writeln!(out, "element face {faces}")?;
        writeln!(out, "property list uchar int vertex_indices")?;
    }
    writeln!(out, "end_header")
}

/// Write a point cloud as a binary PLY file.
///
/// Normals are written only when every point carries one.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), points = cloud.len()))]
pub fn write_cloud_ply(path: impl AsRef<Path>, cloud: &PointCloud) -> Result<(), PlyError> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    let with_normals = cloud.has_normals();
    write_header(&mut out, cloud.len(), with_normals, None)?;

    if with_normals {
        let records: Vec<[f32; 6]> = cloud
            .points
            .iter()
            .map(|p| {
                let n = p.normal.unwrap_or_default();
                [p.position.x, p.position.y, p.position.z, n.x, n.y, n.z]
            })
            .collect();
        out.write_all(bytemuck::cast_slice(&records))?;
    } else {
        let records: Vec<[f32; 3]> = cloud.points.iter().map(|p| p.position.to_array()).collect();
        out.write_all(bytemuck::cast_slice(&records))?;
    }
    out.flush()?;

    info!("Wrote {} points ({} normals)", cloud.len(), if with_normals { "with" } else { "without" });
    Ok(())
}

/// Write a triangle mesh as a binary PLY file.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), triangles = mesh.triangle_count()))]
pub fn write_mesh_ply(path: impl AsRef<Path>, mesh: &Mesh) -> Result<(), PlyError> {
    let vertex_count = mesh.vertices.len();
    for (face, tri) in mesh.triangles.iter().enumerate() {
        if let Some(&vertex) = tri.iter().find(|&&v| v as usize >= vertex_count) {
            return Err(PlyError::InvalidFace {
                face,
                vertex,
                vertex_count,
            });
        }
    }

    let with_normals = !mesh.normals.is_empty() && mesh.normals.len() == vertex_count;
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    write_header(&mut out, vertex_count, with_normals, Some(mesh.triangles.len()))?;

    for (i, v) in mesh.vertices.iter().enumerate() {
        out.write_all(bytemuck::bytes_of(&v.to_array()))?;
        if with_normals {
            out.write_all(bytemuck::bytes_of(&mesh.normals[i].to_array()))?;
        }
    }
    for tri in &mesh.triangles {
        let indices = tri.map(|i| i as i32);
        out.write_all(&[3u8])?;
        out.write_all(bytemuck::bytes_of(&indices))?;
    }
    out.flush()?;

    debug!("Wrote mesh with {} vertices", vertex_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ply::{load_cloud_from_ply, ply_has_faces};
    use crate::types::Point;
    use glam::Vec3;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kinfu-data-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_cloud_export_is_readable() {
        let cloud: PointCloud = (0..10)
            .map(|i| Point::with_normal(Vec3::new(i as f32 * 0.1, 0.5, 1.0), Vec3::Z))
            .collect();
        let path = temp_path("cloud.ply");
        write_cloud_ply(&path, &cloud).unwrap();

        let loaded = load_cloud_from_ply(&path).unwrap();
        assert_eq!(loaded.len(), 10);
        assert!((loaded.points[3].position - Vec3::new(0.3, 0.5, 1.0)).length() < 1e-6);
        assert_eq!(loaded.points[3].normal, Some(Vec3::Z));
        assert!(!ply_has_faces(&path).unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mesh_export_has_faces() {
        let mesh = Mesh {
            vertices: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            normals: vec![Vec3::Z; 3],
            triangles: vec![[0, 1, 2]],
        };
        let path = temp_path("mesh.ply");
        write_mesh_ply(&path, &mesh).unwrap();
        assert!(ply_has_faces(&path).unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mesh_export_rejects_dangling_index() {
        let mesh = Mesh {
            vertices: vec![Vec3::ZERO, Vec3::X],
            normals: Vec::new(),
            triangles: vec![[0, 1, 2]],
        };
        let path = temp_path("bad.ply");
        let err = write_mesh_ply(&path, &mesh).unwrap_err();
        assert!(matches!(err, PlyError::InvalidFace { vertex: 2, .. }));
    }
}
