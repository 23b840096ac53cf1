//! Ray casting the TSDF volume into depth, point and normal maps.

use crate::ingest::{DepthMap, Intrinsics, Map2D, NormalMap, PointMap, Pyramid};
use crate::params::KinFuParams;
use crate::scene::volume::TsdfVolume;
use glam::{Affine3A, Vec3};
use rayon::prelude::*;
use tracing::debug;

/// Samples above this value are treated as saturated free space.
const FREE_SPACE: f32 = 0.99;
const REFINE_ITERATIONS: usize = 3;

/// Synthetic view of the model. Depth is camera-frame z (0 = no hit); points
/// and normals are camera-frame (`Vec3::NAN` = no hit).
#[derive(Debug, Clone)]
pub struct Raycast {
    pub depth: DepthMap,
    pub points: PointMap,
    pub normals: NormalMap,
    /// Camera pose the view was rendered from (camera to world).
    pub pose: Affine3A,
    pub intrinsics: Intrinsics,
}

impl Raycast {
    pub fn width(&self) -> usize {
        self.depth.width()
    }

    pub fn height(&self) -> usize {
        self.depth.height()
    }

    pub fn hit_count(&self) -> usize {
        self.depth.data().iter().filter(|&&d| d > 0.0).count()
    }

    /// Model pyramid for the pose tracker.
    pub fn to_pyramid(&self, levels: usize) -> Pyramid {
        Pyramid::from_point_normal_maps(
            self.points.clone(),
            self.normals.clone(),
            &self.intrinsics,
            levels,
        )
    }
}

#[derive(Debug, Clone)]
pub struct RayCaster {
    width: usize,
    height: usize,
    step_factor: f32,
}

impl RayCaster {
    pub fn new(params: &KinFuParams) -> Self {
        Self {
            width: params.cols,
            height: params.rows,
            step_factor: params.raycast_step_factor,
        }
    }

    /// Caster for a different output resolution than the sensor's.
    pub fn with_resolution(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Render the zero level set seen from `pose` (camera to world).
    #[tracing::instrument(skip_all)]
    pub fn render(&self, volume: &TsdfVolume, pose: &Affine3A, intrinsics: &Intrinsics) -> Raycast {
        let volume_from_cam = volume.pose().inverse() * *pose;
        let cam_from_volume = volume_from_cam.inverse();
        let origin = Vec3::from(volume_from_cam.translation);
        let voxel_size = volume.voxel_size();
        let step = self.step_factor * voxel_size.min_element();
        let stride = volume.trunc_dist() * 0.5;
        // Trilinear samples need a full neighbourhood, so stay one voxel inside.
        let lo = voxel_size;
        let hi = volume.size() - voxel_size;
        let width = self.width;

        let hits: Vec<Option<(f32, Vec3)>> = (0..self.height)
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..width).map(move |x| {
                    let ray = intrinsics.ray(x as f32, y as f32);
                    let dir = volume_from_cam.transform_vector3(ray);
                    cast_ray(volume, origin, dir, lo, hi, step, stride)
                        .map(|(t, gradient)| (t, cam_from_volume.transform_vector3(gradient)))
                })
            })
            .collect();

        let mut depth = Vec::with_capacity(hits.len());
        let mut points = Vec::with_capacity(hits.len());
        let mut normals = Vec::with_capacity(hits.len());
        for (i, hit) in hits.into_iter().enumerate() {
            match hit {
                Some((t, normal)) => {
                    let (x, y) = (i % width, i / width);
                    depth.push(t);
                    points.push(intrinsics.ray(x as f32, y as f32) * t);
                    normals.push(normal);
                }
                None => {
                    depth.push(0.0);
                    points.push(Vec3::NAN);
                    normals.push(Vec3::NAN);
                }
            }
        }

        let raycast = Raycast {
            depth: Map2D::from_parts(width, self.height, depth),
            points: Map2D::from_parts(width, self.height, points),
            normals: Map2D::from_parts(width, self.height, normals),
            pose: *pose,
            intrinsics: *intrinsics,
        };
        debug!("Raycast {}x{}: {} hits", width, self.height, raycast.hit_count());
        raycast
    }
}

/// March one ray through the volume. `dir` has unit camera-z, so the returned
/// parameter is the camera-frame depth of the hit. The gradient is returned
/// normalized, in volume-local coordinates.
fn cast_ray(
    volume: &TsdfVolume,
    origin: Vec3,
    dir: Vec3,
    lo: Vec3,
    hi: Vec3,
    step: f32,
    stride: f32,
) -> Option<(f32, Vec3)> {
    let inv = dir.recip();
    let t0 = (lo - origin) * inv;
    let t1 = (hi - origin) * inv;
    let t_enter = t0.min(t1).max_element().max(0.0);
    let t_exit = t0.max(t1).min_element();
    if !(t_enter < t_exit) {
        return None;
    }

    let scale = dir.length();
    let t_step = step / scale;
    let t_stride = stride.max(step) / scale;

    let mut previous: Option<(f32, f32)> = None;
    let mut t = t_enter;
    while t < t_exit {
        let Some(f) = volume.sample_local(origin + dir * t) else {
            previous = None;
            t += t_step;
            continue;
        };

        if let Some((tp, fp)) = previous {
            if fp > 0.0 && f < 0.0 {
                let t_hit = refine(volume, origin, dir, (tp, fp), (t, f));
                let gradient = volume
                    .gradient_local(origin + dir * t_hit)?
                    .normalize_or_zero();
                if gradient == Vec3::ZERO {
                    return None;
                }
                return Some((t_hit, gradient));
            }
            if fp < 0.0 && f > 0.0 {
                // Leaving a surface from behind.
                return None;
            }
        }

        previous = Some((t, f));
        t += if f > FREE_SPACE { t_stride } else { t_step };
    }
    None
}

/// Regula falsi on a bracket with `a.1 > 0 > b.1`.
fn refine(volume: &TsdfVolume, origin: Vec3, dir: Vec3, mut a: (f32, f32), mut b: (f32, f32)) -> f32 {
    let mut t = a.0 + (b.0 - a.0) * a.1 / (a.1 - b.1);
    for _ in 0..REFINE_ITERATIONS {
        let Some(f) = volume.sample_local(origin + dir * t) else {
            break;
        };
        if f.abs() < 1e-5 {
            break;
        }
        if f > 0.0 {
            a = (t, f);
        } else {
            b = (t, f);
        }
        t = a.0 + (b.0 - a.0) * a.1 / (a.1 - b.1);
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    fn volume() -> TsdfVolume {
        TsdfVolume::new(
            UVec3::splat(48),
            Vec3::splat(0.96),
            Affine3A::from_translation(Vec3::new(-0.48, -0.48, 0.3)),
            0.06,
            64.0,
        )
        .unwrap()
    }

    fn caster() -> (RayCaster, Intrinsics) {
        let caster = RayCaster {
            width: 80,
            height: 60,
            step_factor: 0.75,
        };
        (caster, Intrinsics::kinect(80, 60))
    }

    #[test]
    fn test_empty_volume_has_no_hits() {
        let (caster, k) = caster();
        let raycast = caster.render(&volume(), &Affine3A::IDENTITY, &k);
        assert_eq!(raycast.hit_count(), 0);
        assert!(raycast.points.data().iter().all(|p| p.is_nan()));
    }

    #[test]
    fn test_raycast_plane() {
        let mut volume = volume();
        volume.fill_with_sdf(|p| 0.9 - p.z);
        let (caster, k) = caster();
        let raycast = caster.render(&volume, &Affine3A::IDENTITY, &k);

        for (x, y) in [(40, 30), (30, 20), (50, 40)] {
            let d = raycast.depth.at(x, y);
            assert!((d - 0.9).abs() < 0.005, "depth {d} at ({x}, {y})");
            let n = raycast.normals.at(x, y);
            assert!(n.dot(Vec3::NEG_Z) > 0.99, "normal {n:?}");
            let p = raycast.points.at(x, y);
            assert!((p.z - d).abs() < 1e-6);
        }
    }

    #[test]
    fn test_raycast_sphere() {
        let center = Vec3::new(0.0, 0.0, 0.8);
        let radius = 0.2;
        let mut volume = volume();
        volume.fill_with_sdf(|p| (p - center).length() - radius);
        let (caster, k) = caster();
        let raycast = caster.render(&volume, &Affine3A::IDENTITY, &k);

        let d = raycast.depth.at(40, 30);
        assert!((d - 0.6).abs() < 0.005, "centre depth {d}");
        // Every hit lies on the sphere and its normal points back at the camera.
        for (p, n) in raycast.points.data().iter().zip(raycast.normals.data()) {
            if p.is_nan() {
                continue;
            }
            assert!(((*p - center).length() - radius).abs() < 0.01);
            assert!(n.dot(*p) < 0.0);
        }
        // Corners of the image look past the sphere.
        assert_eq!(raycast.depth.at(0, 0), 0.0);
        assert!(raycast.hit_count() > 500);
    }

    #[test]
    fn test_raycast_from_shifted_pose() {
        let center = Vec3::new(0.0, 0.0, 0.8);
        let mut volume = volume();
        volume.fill_with_sdf(|p| (p - center).length() - 0.2);
        let (caster, k) = caster();

        let pose = Affine3A::from_translation(Vec3::new(0.0, 0.0, -0.1));
        let raycast = caster.render(&volume, &pose, &k);
        let d = raycast.depth.at(40, 30);
        assert!((d - 0.7).abs() < 0.005, "centre depth {d}");
        assert_eq!(raycast.pose, pose);
    }

    #[test]
    fn test_back_faces_stop_rays() {
        // Negative in front of the plane: the camera looks at it from behind.
        let mut volume = volume();
        volume.fill_with_sdf(|p| p.z - 0.9);
        let (caster, k) = caster();
        let raycast = caster.render(&volume, &Affine3A::IDENTITY, &k);
        assert_eq!(raycast.hit_count(), 0);
    }

    #[test]
    fn test_camera_inside_volume() {
        let center = Vec3::new(0.0, 0.0, 0.8);
        let mut volume = volume();
        volume.fill_with_sdf(|p| 0.3 - (p - center).length());
        let (caster, k) = caster();
        let pose = Affine3A::from_translation(center);
        let raycast = caster.render(&volume, &pose, &k);

        // Inside the ball the field is positive, so rays hit the wall from the inside.
        assert!((raycast.depth.at(40, 30) - 0.3).abs() < 0.01);
    }
}
