//! Analytic scenes rendered into depth frames.
//!
//! Used by the tests and by the simulated sensor in `kinfu-capture`. World
//! coordinates follow the camera convention of the first frame: x right,
//! y down, z forward.

use crate::ingest::{DepthFrame, Intrinsics, Map2D};
use glam::{Affine3A, Mat3, Quat, Vec3};
use rayon::prelude::*;

/// Surfaces a [`Scene`] is made of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Sphere {
        center: Vec3,
        radius: f32,
    },
    /// Oriented box.
    Cuboid {
        center: Vec3,
        half_extents: Vec3,
        rotation: Quat,
    },
    /// Infinite plane; the normal side is outside.
    Plane { point: Vec3, normal: Vec3 },
}

impl Primitive {
    /// Smallest positive ray parameter where `origin + t * dir` hits the surface.
    pub fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        match *self {
            Primitive::Sphere { center, radius } => {
                let oc = origin - center;
                let a = dir.length_squared();
                let b = oc.dot(dir);
                let c = oc.length_squared() - radius * radius;
                let disc = b * b - a * c;
                if disc < 0.0 {
                    return None;
                }
                let sqrt = disc.sqrt();
                [(-b - sqrt) / a, (-b + sqrt) / a]
                    .into_iter()
                    .find(|&t| t > 0.0)
            }
            Primitive::Cuboid {
                center,
                half_extents,
                rotation,
            } => {
                let inv = rotation.inverse();
                let o = inv * (origin - center);
                let d = inv * dir;
                let recip = d.recip();
                let t0 = (-half_extents - o) * recip;
                let t1 = (half_extents - o) * recip;
                let t_enter = t0.min(t1).max_element();
                let t_exit = t0.max(t1).min_element();
                if t_enter > t_exit || t_exit <= 0.0 {
                    None
                } else if t_enter > 0.0 {
                    Some(t_enter)
                } else {
                    Some(t_exit)
                }
            }
            Primitive::Plane { point, normal } => {
                let denom = normal.dot(dir);
                if denom.abs() < 1e-9 {
                    return None;
                }
                let t = normal.dot(point - origin) / denom;
                (t > 0.0).then_some(t)
            }
        }
    }

    /// Signed distance, negative inside.
    pub fn sdf(&self, p: Vec3) -> f32 {
        match *self {
            Primitive::Sphere { center, radius } => (p - center).length() - radius,
            Primitive::Cuboid {
                center,
                half_extents,
                rotation,
            } => {
                let q = (rotation.inverse() * (p - center)).abs() - half_extents;
                q.max(Vec3::ZERO).length() + q.max_element().min(0.0)
            }
            Primitive::Plane { point, normal } => normal.normalize().dot(p - point),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub primitives: Vec<Primitive>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, primitive: Primitive) -> Self {
        self.primitives.push(primitive);
        self
    }

    /// A box and a ball on a floor in front of a back wall, two metres ahead
    /// of the origin.
    pub fn tabletop() -> Self {
        Self::new()
            .with(Primitive::Plane {
                point: Vec3::new(0.0, 0.5, 0.0),
                normal: Vec3::NEG_Y,
            })
            .with(Primitive::Plane {
                point: Vec3::new(0.0, 0.0, 3.0),
                normal: Vec3::NEG_Z,
            })
            .with(Primitive::Cuboid {
                center: Vec3::new(-0.1, 0.3, 2.0),
                half_extents: Vec3::splat(0.2),
                rotation: Quat::from_rotation_y(0.5),
            })
            .with(Primitive::Sphere {
                center: Vec3::new(0.45, 0.35, 1.8),
                radius: 0.15,
            })
    }

    pub fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        self.primitives
            .iter()
            .filter_map(|p| p.intersect(origin, dir))
            .min_by(f32::total_cmp)
    }

    pub fn sdf(&self, p: Vec3) -> f32 {
        self.primitives
            .iter()
            .map(|prim| prim.sdf(p))
            .fold(f32::INFINITY, f32::min)
    }

    /// Depth frame (millimetres) seen from `pose` (camera to world).
    pub fn render_depth(
        &self,
        pose: &Affine3A,
        intrinsics: &Intrinsics,
        width: usize,
        height: usize,
    ) -> DepthFrame {
        let origin = Vec3::from(pose.translation);
        let mut data = vec![0u16; width * height];
        data.par_chunks_mut(width.max(1))
            .enumerate()
            .for_each(|(y, row)| {
                for (x, value) in row.iter_mut().enumerate() {
                    // Unit camera-z ray, so the hit parameter is the z depth.
                    let dir = pose.transform_vector3(intrinsics.ray(x as f32, y as f32));
                    if let Some(t) = self.intersect(origin, dir) {
                        let mm = (t * 1000.0).round();
                        if mm < u16::MAX as f32 {
                            *value = mm as u16;
                        }
                    }
                }
            });
        Map2D::from_parts(width, height, data)
    }
}

/// Camera pose at `eye` looking at `target`, with `up` as the world up
/// direction (camera y points opposite to it).
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Affine3A {
    let forward = (target - eye).normalize();
    let right = forward.cross(up).normalize();
    let down = forward.cross(right);
    Affine3A::from_mat3_translation(Mat3::from_cols(right, down, forward), eye)
}

/// Pose on a circle of `radius` around `center`, raised by `elevation`
/// (against world y) and looking at the centre. Angle 0 sits at `-z` from
/// the centre.
pub fn orbit_pose(center: Vec3, radius: f32, elevation: f32, angle: f32) -> Affine3A {
    let eye = center + Vec3::new(radius * angle.sin(), -elevation, -radius * angle.cos());
    look_at(eye, center, Vec3::NEG_Y)
}
