//! Mesh reconstruction from point/normal clouds.
//!
//! Points are grouped by the dominant axis of their normal and each group is
//! triangulated with a 2D Delaunay triangulation on the plane orthogonal to
//! that axis. Triangles that bridge gaps (long edges) or fold away from the
//! sampled surface (face normal far from the vertex normals) are dropped.

use crate::types::{Mesh, PointCloud, Triangle};
use delaunator::{Point, triangulate};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Plane used to flatten points before the 2D triangulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPlane {
    XY,
    XZ,
    YZ,
}

impl ProjectionPlane {
    fn project(self, p: Vec3) -> Point {
        match self {
            ProjectionPlane::XY => Point {
                x: p.x as f64,
                y: p.y as f64,
            },
            ProjectionPlane::XZ => Point {
                x: p.x as f64,
                y: p.z as f64,
            },
            ProjectionPlane::YZ => Point {
                x: p.y as f64,
                y: p.z as f64,
            },
        }
    }

    /// Plane orthogonal to the dominant component of `normal`.
    pub fn facing(normal: Vec3) -> Self {
        let a = normal.abs();
        if a.z >= a.x && a.z >= a.y {
            ProjectionPlane::XY
        } else if a.y >= a.x {
            ProjectionPlane::XZ
        } else {
            ProjectionPlane::YZ
        }
    }
}

/// Analyze point cloud and determine the best projection plane for triangulation.
pub fn best_projection_plane(positions: &[Vec3]) -> ProjectionPlane {
    if positions.is_empty() {
        return ProjectionPlane::XY;
    }

    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);

    for pos in positions {
        min = min.min(*pos);
        max = max.max(*pos);
    }

    let extent = max - min;

    // Choose the plane that maximizes spread (avoid the smallest dimension)
    if extent.z <= extent.x && extent.z <= extent.y {
        ProjectionPlane::XY
    } else if extent.y <= extent.x && extent.y <= extent.z {
        ProjectionPlane::XZ
    } else {
        ProjectionPlane::YZ
    }
}

fn triangulate_on_plane(positions: &[Vec3], plane: ProjectionPlane) -> Vec<[usize; 3]> {
    if positions.len() < 3 {
        return Vec::new();
    }

    let points: Vec<Point> = positions.iter().map(|p| plane.project(*p)).collect();
    let result = triangulate(&points);

    let mut triangles = Vec::with_capacity(result.triangles.len() / 3);
    for chunk in result.triangles.chunks_exact(3) {
        triangles.push([chunk[0], chunk[1], chunk[2]]);
    }
    triangles
}

/// Perform 2D Delaunay triangulation on a set of 3D points.
///
/// Automatically selects the best projection plane based on point distribution.
///
/// Returns a list of triangle index triplets `[i0, i1, i2]`.
pub fn triangulate_points(positions: &[Vec3]) -> Vec<[usize; 3]> {
    if positions.len() < 3 {
        warn!("Not enough points for triangulation (need at least 3)");
        return Vec::new();
    }

    let plane = best_projection_plane(positions);
    let triangles = triangulate_on_plane(positions, plane);

    debug!(
        "Triangulated {} points into {} triangles (plane: {:?})",
        positions.len(),
        triangles.len(),
        plane
    );

    triangles
}

/// Parameters for [`reconstruct_mesh`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshParams {
    /// Maximum distance between connected points (meters).
    pub max_edge_length: f32,
    /// Maximum angle between a face normal and its vertex normals (radians).
    pub max_surface_angle: f32,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            max_edge_length: 0.1,
            max_surface_angle: std::f32::consts::FRAC_PI_4,
        }
    }
}

/// Build a triangle mesh from a point cloud.
///
/// Clouds without normals are triangulated as a single height field on the
/// plane of largest spread.
#[tracing::instrument(skip_all, fields(points = cloud.len()))]
pub fn reconstruct_mesh(cloud: &PointCloud, params: &MeshParams) -> Mesh {
    if cloud.len() < 3 {
        warn!("Not enough points for mesh reconstruction (need at least 3)");
        return Mesh::default();
    }

    let vertices = cloud.positions();
    let normals: Vec<Vec3> = if cloud.has_normals() {
        cloud.points.iter().filter_map(|p| p.normal).collect()
    } else {
        Vec::new()
    };

    // One group per signed dominant axis keeps opposite faces of thin
    // structures apart.
    let mut groups: Vec<(ProjectionPlane, Vec<usize>)> = Vec::new();
    if normals.is_empty() {
        groups.push((best_projection_plane(&vertices), (0..vertices.len()).collect()));
    } else {
        let mut buckets: [Vec<usize>; 6] = Default::default();
        for (i, n) in normals.iter().enumerate() {
            let axis = match ProjectionPlane::facing(*n) {
                ProjectionPlane::YZ => 0,
                ProjectionPlane::XZ => 1,
                ProjectionPlane::XY => 2,
            };
            let negative = n[axis] < 0.0;
            buckets[axis * 2 + negative as usize].push(i);
        }
        for (bucket, indices) in buckets.into_iter().enumerate() {
            let plane = match bucket / 2 {
                0 => ProjectionPlane::YZ,
                1 => ProjectionPlane::XZ,
                _ => ProjectionPlane::XY,
            };
            groups.push((plane, indices));
        }
    }

    let cos_limit = params.max_surface_angle.cos();
    let mut triangles = Vec::new();
    let mut rejected = 0usize;

    for (plane, indices) in &groups {
        let positions: Vec<Vec3> = indices.iter().map(|&i| vertices[i]).collect();
        for local in triangulate_on_plane(&positions, *plane) {
            let [a, b, c] = local.map(|l| indices[l]);
            let tri = Triangle::new(vertices[a], vertices[b], vertices[c]);
            if tri.max_edge() > params.max_edge_length {
                rejected += 1;
                continue;
            }

            let face = tri.unit_normal();
            if face == Vec3::ZERO {
                rejected += 1;
                continue;
            }

            if normals.is_empty() {
                triangles.push([a as u32, b as u32, c as u32]);
                continue;
            }

            let mean = (normals[a] + normals[b] + normals[c]).normalize_or_zero();
            let folded = [a, b, c]
                .iter()
                .any(|&v| face.dot(normals[v]).abs() < cos_limit);
            if folded {
                rejected += 1;
                continue;
            }

            // Wind counter-clockwise around the sampled normal.
            if face.dot(mean) < 0.0 {
                triangles.push([a as u32, c as u32, b as u32]);
            } else {
                triangles.push([a as u32, b as u32, c as u32]);
            }
        }
    }

    info!(
        "Reconstructed mesh: {} triangles from {} points ({} rejected)",
        triangles.len(),
        vertices.len(),
        rejected
    );

    Mesh {
        vertices,
        normals,
        triangles,
    }
}
