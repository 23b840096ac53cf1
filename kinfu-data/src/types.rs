//! Core data types for point clouds and meshes.
//!
//! These are the CPU-side representations handed to callers of the fusion
//! pipeline. They are immutable snapshots: nothing in the pipeline keeps a
//! reference to a cloud or mesh once it has been produced.

use glam::Vec3;

/// A surface sample in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Position in world space.
    pub position: Vec3,
    /// Unit surface normal, when known.
    pub normal: Option<Vec3>,
    /// RGB color (linear, 0-1 range).
    pub color: Vec3,
}

impl Point {
    /// Create a new point with position and color.
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self {
            position,
            normal: None,
            color,
        }
    }

    /// Create a light gray point carrying a surface normal.
    pub fn with_normal(position: Vec3, normal: Vec3) -> Self {
        Self {
            position,
            normal: Some(normal),
            color: Vec3::splat(0.8),
        }
    }
}

impl Default for Point {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            normal: None,
            color: Vec3::splat(0.8),
        }
    }
}

/// An ordered sequence of surface points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True when every point carries a normal.
    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.normal.is_some())
    }

    pub fn positions(&self) -> Vec<Vec3> {
        self.points.iter().map(|p| p.position).collect()
    }

    /// Axis-aligned bounds as `(min, max)`, `None` for an empty cloud.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        if self.points.is_empty() {
            return None;
        }
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for p in &self.points {
            min = min.min(p.position);
            max = max.max(p.position);
        }
        Some((min, max))
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Indexed triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    /// Per-vertex normals; either empty or the same length as `vertices`.
    pub normals: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Resolve the `index`-th face into a [`Triangle`].
    pub fn triangle(&self, index: usize) -> Option<Triangle> {
        let [a, b, c] = *self.triangles.get(index)?;
        Some(Triangle::new(
            *self.vertices.get(a as usize)?,
            *self.vertices.get(b as usize)?,
            *self.vertices.get(c as usize)?,
        ))
    }

    /// Total surface area.
    pub fn area(&self) -> f32 {
        (0..self.triangles.len())
            .filter_map(|i| self.triangle(i))
            .map(|t| t.area())
            .sum()
    }
}

/// A triangle in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub v0: Vec3,
    pub v1: Vec3,
    pub v2: Vec3,
}

impl Triangle {
    pub fn new(v0: Vec3, v1: Vec3, v2: Vec3) -> Self {
        Self { v0, v1, v2 }
    }

    /// Compute the center (centroid) of the triangle.
    pub fn center(&self) -> Vec3 {
        (self.v0 + self.v1 + self.v2) / 3.0
    }

    /// Compute the normal of the triangle (not normalized).
    pub fn normal(&self) -> Vec3 {
        let e1 = self.v1 - self.v0;
        let e2 = self.v2 - self.v0;
        e1.cross(e2)
    }

    /// Compute the normalized normal of the triangle.
    pub fn unit_normal(&self) -> Vec3 {
        self.normal().normalize_or_zero()
    }

    /// Compute the area of the triangle.
    pub fn area(&self) -> f32 {
        self.normal().length() * 0.5
    }

    /// Length of the longest edge.
    pub fn max_edge(&self) -> f32 {
        let a = self.v0.distance(self.v1);
        let b = self.v1.distance(self.v2);
        let c = self.v2.distance(self.v0);
        a.max(b).max(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_creation() {
        let p = Point::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(p.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(p.color, Vec3::new(1.0, 0.0, 0.0));
        assert!(p.normal.is_none());
    }

    #[test]
    fn test_cloud_bounds() {
        let cloud: PointCloud = [
            Vec3::new(-1.0, 0.0, 2.0),
            Vec3::new(1.0, 3.0, -2.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
        .into_iter()
        .map(|p| Point::with_normal(p, Vec3::Z))
        .collect();

        let (min, max) = cloud.bounds().unwrap();
        assert_eq!(min, Vec3::new(-1.0, 0.0, -2.0));
        assert_eq!(max, Vec3::new(1.0, 3.0, 2.0));
        assert!(cloud.has_normals());
        assert!(PointCloud::default().bounds().is_none());
    }

    #[test]
    fn test_triangle_center() {
        let t = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            Vec3::new(0.0, 3.0, 0.0),
        );
        assert_eq!(t.center(), Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(t.max_edge(), 18.0f32.sqrt());
    }

    #[test]
    fn test_triangle_normal() {
        let t = Triangle::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        let normal = t.unit_normal();
        assert!((normal - Vec3::Z).length() < 0.001);
    }

    #[test]
    fn test_mesh_area() {
        let mesh = Mesh {
            vertices: vec![
                Vec3::ZERO,
                Vec3::X,
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::Y,
            ],
            normals: Vec::new(),
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        };
        assert!((mesh.area() - 1.0).abs() < 1e-6);
        assert!(mesh.triangle(2).is_none());
    }
}
