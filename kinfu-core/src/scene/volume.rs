//! Truncated signed distance volume.
//!
//! The grid covers a box of `size` metres with `dims` voxels and sits in the
//! world at `pose` (volume-local to world). Voxel `(x, y, z)` is centred at
//! `(index + 0.5) * voxel_size` in volume-local coordinates and stored at
//! `x + dx * (y + dy * z)`.

use crate::error::KinFuError;
use crate::ingest::{DepthMap, Intrinsics};
use crate::params::KinFuParams;
use glam::{Affine3A, UVec3, Vec3};
use kinfu_data::{Point, PointCloud};
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// A single cell of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Voxel {
    /// Signed distance divided by the truncation distance, in `[-1, 1]`.
    pub tsdf: f32,
    /// Accumulated observation weight; 0 means never observed.
    pub weight: f32,
}

impl Voxel {
    pub const EMPTY: Voxel = Voxel {
        tsdf: 0.0,
        weight: 0.0,
    };

    #[inline]
    pub fn is_observed(&self) -> bool {
        self.weight > 0.0
    }
}

/// Result of [`TsdfVolume::extract_points`].
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub cloud: PointCloud,
    /// Zero crossings found in the volume, including those past the capacity.
    pub crossings: usize,
}

impl Extraction {
    /// Whether crossings were dropped to honour the capacity.
    pub fn is_truncated(&self) -> bool {
        self.crossings > self.cloud.len()
    }
}

#[derive(Debug, Clone)]
pub struct TsdfVolume {
    dims: UVec3,
    size: Vec3,
    voxel_size: Vec3,
    pose: Affine3A,
    trunc_dist: f32,
    max_weight: f32,
    gradient_delta_factor: f32,
    voxels: Vec<Voxel>,
}

impl TsdfVolume {
    /// Allocate an empty volume. Fails when the voxel buffer cannot be reserved.
    pub fn new(
        dims: UVec3,
        size: Vec3,
        pose: Affine3A,
        trunc_dist: f32,
        max_weight: f32,
    ) -> Result<Self, KinFuError> {
        let count = (dims.x as u64)
            .checked_mul(dims.y as u64)
            .and_then(|n| n.checked_mul(dims.z as u64))
            .ok_or_else(|| KinFuError::VolumeAllocation {
                voxels: u64::MAX,
                reason: format!("voxel count of {dims} overflows"),
            })?;
        let len = usize::try_from(count).map_err(|e| KinFuError::VolumeAllocation {
            voxels: count,
            reason: e.to_string(),
        })?;

        let mut voxels = Vec::new();
        voxels
            .try_reserve_exact(len)
            .map_err(|e| KinFuError::VolumeAllocation {
                voxels: count,
                reason: e.to_string(),
            })?;
        voxels.resize(len, Voxel::EMPTY);

        info!(
            "Allocated TSDF volume {}x{}x{} over {:?} m ({:.1} MiB)",
            dims.x,
            dims.y,
            dims.z,
            size.to_array(),
            (len * std::mem::size_of::<Voxel>()) as f64 / (1024.0 * 1024.0)
        );

        Ok(Self {
            dims,
            size,
            voxel_size: size / dims.as_vec3(),
            pose,
            trunc_dist,
            max_weight,
            gradient_delta_factor: 0.5,
            voxels,
        })
    }

    pub fn from_params(params: &KinFuParams) -> Result<Self, KinFuError> {
        let mut volume = Self::new(
            params.volume_dims,
            params.volume_size,
            params.volume_pose.affine(),
            params.tsdf_trunc_dist,
            params.tsdf_max_weight,
        )?;
        volume.gradient_delta_factor = params.gradient_delta_factor;
        Ok(volume)
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn voxel_size(&self) -> Vec3 {
        self.voxel_size
    }

    pub fn pose(&self) -> Affine3A {
        self.pose
    }

    pub fn set_pose(&mut self, pose: Affine3A) {
        self.pose = pose;
    }

    pub fn trunc_dist(&self) -> f32 {
        self.trunc_dist
    }

    pub fn max_weight(&self) -> f32 {
        self.max_weight
    }

    #[inline]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        x as usize + self.dims.x as usize * (y as usize + self.dims.y as usize * z as usize)
    }

    pub fn voxel(&self, x: u32, y: u32, z: u32) -> Option<Voxel> {
        if x < self.dims.x && y < self.dims.y && z < self.dims.z {
            Some(self.voxels[self.index(x, y, z)])
        } else {
            None
        }
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    pub fn observed_voxels(&self) -> usize {
        self.voxels.par_iter().filter(|v| v.is_observed()).count()
    }

    /// Clear every voxel back to [`Voxel::EMPTY`].
    pub fn reset(&mut self) {
        self.voxels.par_iter_mut().for_each(|v| *v = Voxel::EMPTY);
        debug!("TSDF volume reset");
    }

    #[inline]
    fn voxel_center(&self, x: u32, y: u32, z: u32) -> Vec3 {
        (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * self.voxel_size
    }

    /// Whether a world point lies inside the volume box.
    pub fn contains(&self, world: Vec3) -> bool {
        let local = self.pose.inverse().transform_point3(world);
        local.cmpge(Vec3::ZERO).all() && local.cmplt(self.size).all()
    }

    /// Fuse a metric depth map seen from `camera_pose` (camera to world).
    #[tracing::instrument(skip_all)]
    pub fn integrate(&mut self, depth: &DepthMap, intrinsics: &Intrinsics, camera_pose: &Affine3A) {
        let cam_from_volume = camera_pose.inverse() * self.pose;
        let dx = self.dims.x;
        let dy = self.dims.y;
        let slice = dx as usize * dy as usize;
        let voxel_size = self.voxel_size;
        let trunc = self.trunc_dist;
        let max_weight = self.max_weight;
        let width = depth.width() as i64;
        let height = depth.height() as i64;

        let updated: usize = self
            .voxels
            .par_chunks_mut(slice.max(1))
            .enumerate()
            .map(|(z, voxels)| {
                let mut updated = 0;
                for y in 0..dy {
                    for x in 0..dx {
                        let local = (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * voxel_size;
                        let p = cam_from_volume.transform_point3(local);
                        if p.z <= 0.0 {
                            continue;
                        }

                        let uv = intrinsics.project(p);
                        let u = uv.x.round() as i64;
                        let v = uv.y.round() as i64;
                        if u < 0 || v < 0 || u >= width || v >= height {
                            continue;
                        }
                        let d = depth.at(u as usize, v as usize);
                        if d <= 0.0 {
                            continue;
                        }

                        // Distance along the viewing ray through the voxel.
                        let sdf = (d - p.z) * p.length() / p.z;
                        if sdf < -trunc {
                            continue;
                        }
                        let tsdf = (sdf / trunc).min(1.0);

                        let voxel = &mut voxels[x as usize + dx as usize * y as usize];
                        let w = voxel.weight;
                        voxel.tsdf = (voxel.tsdf * w + tsdf) / (w + 1.0);
                        voxel.weight = (w + 1.0).min(max_weight);
                        updated += 1;
                    }
                }
                updated
            })
            .sum();

        debug!("Integrated depth map: {} voxels updated", updated);
    }

    /// Trilinear TSDF at a volume-local point; `None` outside the grid or when
    /// any of the eight neighbouring voxels is unobserved.
    pub(crate) fn sample_local(&self, local: Vec3) -> Option<f32> {
        let g = local / self.voxel_size - 0.5;
        // Bounds are checked before the cast so far points cannot saturate.
        let upper = self.dims.saturating_sub(UVec3::ONE).as_vec3();
        if !g.is_finite() || g.cmplt(Vec3::ZERO).any() || g.cmpge(upper).any() {
            return None;
        }
        let base = g.floor();
        let (x0, y0, z0) = (base.x as u32, base.y as u32, base.z as u32);
        let f = g - base;

        let mut c = [0.0f32; 8];
        for (i, value) in c.iter_mut().enumerate() {
            let voxel = self.voxels[self.index(
                x0 + (i & 1) as u32,
                y0 + ((i >> 1) & 1) as u32,
                z0 + ((i >> 2) & 1) as u32,
            )];
            if !voxel.is_observed() {
                return None;
            }
            *value = voxel.tsdf;
        }

        let c00 = c[0] + (c[1] - c[0]) * f.x;
        let c10 = c[2] + (c[3] - c[2]) * f.x;
        let c01 = c[4] + (c[5] - c[4]) * f.x;
        let c11 = c[6] + (c[7] - c[6]) * f.x;
        let c0 = c00 + (c10 - c00) * f.y;
        let c1 = c01 + (c11 - c01) * f.y;
        Some(c0 + (c1 - c0) * f.z)
    }

    /// Central-difference TSDF gradient in volume-local coordinates.
    pub(crate) fn gradient_local(&self, local: Vec3) -> Option<Vec3> {
        let delta = self.voxel_size * self.gradient_delta_factor;
        let mut gradient = Vec3::ZERO;
        for axis in 0..3 {
            let mut offset = Vec3::ZERO;
            offset[axis] = delta[axis];
            let forward = self.sample_local(local + offset)?;
            let backward = self.sample_local(local - offset)?;
            gradient[axis] = (forward - backward) / (2.0 * delta[axis]);
        }
        Some(gradient)
    }

    /// Trilinear TSDF at a world point.
    pub fn sample(&self, world: Vec3) -> Option<f32> {
        self.sample_local(self.pose.inverse().transform_point3(world))
    }

    /// TSDF gradient at a world point, in world coordinates. Points away from
    /// the surface toward free space.
    pub fn gradient(&self, world: Vec3) -> Option<Vec3> {
        let local = self.pose.inverse().transform_point3(world);
        self.gradient_local(local)
            .map(|g| self.pose.transform_vector3(g))
    }

    /// Collect the zero crossings of the field as a world-space point cloud with
    /// normals. At most `capacity` points are kept, the first ones in z, y, x
    /// scan order.
    #[tracing::instrument(skip_all, fields(capacity))]
    pub fn extract_points(&self, capacity: usize) -> Extraction {
        let dx = self.dims.x;
        let dy = self.dims.y;
        let dz = self.dims.z;

        let slices: Vec<Vec<Point>> = (0..dz)
            .into_par_iter()
            .map(|z| {
                let mut points = Vec::new();
                for y in 0..dy {
                    for x in 0..dx {
                        let voxel = self.voxels[self.index(x, y, z)];
                        if !voxel.is_observed() || voxel.tsdf.abs() >= 1.0 {
                            continue;
                        }
                        let a = voxel.tsdf;
                        let neighbours = [
                            (Vec3::X, x + 1 < dx, (x + 1, y, z)),
                            (Vec3::Y, y + 1 < dy, (x, y + 1, z)),
                            (Vec3::Z, z + 1 < dz, (x, y, z + 1)),
                        ];
                        for (axis, inside, (nx, ny, nz)) in neighbours {
                            if !inside {
                                continue;
                            }
                            let other = self.voxels[self.index(nx, ny, nz)];
                            if !other.is_observed() || other.tsdf.abs() >= 1.0 {
                                continue;
                            }
                            let b = other.tsdf;
                            if (a < 0.0) == (b < 0.0) {
                                continue;
                            }

                            let t = a / (a - b);
                            let local = self.voxel_center(x, y, z) + axis * self.voxel_size * t;
                            let fallback = if a > b { -axis } else { axis };
                            let normal = self
                                .gradient_local(local)
                                .map(|g| g.normalize_or_zero())
                                .filter(|n| *n != Vec3::ZERO)
                                .unwrap_or(fallback);

                            points.push(Point::with_normal(
                                self.pose.transform_point3(local),
                                self.pose.transform_vector3(normal),
                            ));
                        }
                    }
                }
                points
            })
            .collect();

        let crossings: usize = slices.iter().map(Vec::len).sum();
        let mut points = Vec::with_capacity(crossings.min(capacity));
        for slice in slices {
            let room = capacity - points.len();
            if room == 0 {
                break;
            }
            points.extend(slice.into_iter().take(room));
        }

        let extraction = Extraction {
            cloud: PointCloud::new(points),
            crossings,
        };
        if extraction.is_truncated() {
            warn!(
                "Point extraction truncated: {} of {} crossings kept",
                extraction.cloud.len(),
                crossings
            );
        } else {
            debug!("Extracted {} points", crossings);
        }
        extraction
    }

    /// Overwrite every voxel with an analytic signed distance (world space).
    #[cfg(test)]
    pub(crate) fn fill_with_sdf(&mut self, sdf: impl Fn(Vec3) -> f32 + Sync) {
        let dx = self.dims.x;
        let slice = dx as usize * self.dims.y as usize;
        let voxel_size = self.voxel_size;
        let pose = self.pose;
        let trunc = self.trunc_dist;
        self.voxels
            .par_chunks_mut(slice)
            .enumerate()
            .for_each(|(z, voxels)| {
                for (i, voxel) in voxels.iter_mut().enumerate() {
                    let x = i as u32 % dx;
                    let y = i as u32 / dx;
                    let local = (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * voxel_size;
                    let d = sdf(pose.transform_point3(local));
                    *voxel = Voxel {
                        tsdf: (d / trunc).clamp(-1.0, 1.0),
                        weight: 1.0,
                    };
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DepthMap;

    /// 32^3 voxels over 0.64 m (2 cm voxels) starting at z = 0.5 in front of
    /// an identity camera.
    fn small_volume() -> TsdfVolume {
        TsdfVolume::new(
            UVec3::splat(32),
            Vec3::splat(0.64),
            Affine3A::from_translation(Vec3::new(-0.32, -0.32, 0.5)),
            0.06,
            64.0,
        )
        .unwrap()
    }

    fn plane_depth(z: f32) -> DepthMap {
        DepthMap::filled(80, 60, z)
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let result = TsdfVolume::new(
            UVec3::new(u32::MAX, u32::MAX, 1),
            Vec3::ONE,
            Affine3A::IDENTITY,
            0.04,
            64.0,
        );
        assert!(matches!(result, Err(KinFuError::VolumeAllocation { .. })));
    }

    #[test]
    fn test_plane_integration_signs() {
        let intrinsics = Intrinsics::kinect(80, 60);
        let mut volume = small_volume();
        volume.integrate(&plane_depth(0.8), &intrinsics, &Affine3A::IDENTITY);

        // Voxels are centred at z = 0.51, 0.53, ...; the plane is at 0.8.
        let in_front = volume.voxel(16, 16, 12).unwrap(); // z = 0.75
        let behind = volume.voxel(16, 16, 16).unwrap(); // z = 0.83
        let far_front = volume.voxel(16, 16, 2).unwrap(); // z = 0.55
        let occluded = volume.voxel(16, 16, 25).unwrap(); // z = 1.01

        assert!(in_front.is_observed() && in_front.tsdf > 0.0 && in_front.tsdf < 1.0);
        assert!(behind.is_observed() && behind.tsdf < 0.0 && behind.tsdf > -1.0);
        assert_eq!(far_front.tsdf, 1.0);
        assert!(!occluded.is_observed());

        let expected = (0.8 - 0.75) / 0.06;
        assert!((in_front.tsdf - expected).abs() < 1e-3);
    }

    #[test]
    fn test_weight_saturation_is_idempotent() {
        let intrinsics = Intrinsics::kinect(80, 60);
        let depth = plane_depth(0.8);
        let mut volume = TsdfVolume::new(
            UVec3::splat(32),
            Vec3::splat(0.64),
            Affine3A::from_translation(Vec3::new(-0.32, -0.32, 0.5)),
            0.06,
            4.0,
        )
        .unwrap();

        for _ in 0..4 {
            volume.integrate(&depth, &intrinsics, &Affine3A::IDENTITY);
        }
        let before = volume.voxel(16, 16, 12).unwrap();
        assert_eq!(before.weight, 4.0);

        for _ in 0..10 {
            volume.integrate(&depth, &intrinsics, &Affine3A::IDENTITY);
        }
        let after = volume.voxel(16, 16, 12).unwrap();
        assert_eq!(after.weight, 4.0);
        assert!((after.tsdf - before.tsdf).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_depth_leaves_volume_untouched() {
        let intrinsics = Intrinsics::kinect(80, 60);
        let mut volume = small_volume();
        volume.integrate(&DepthMap::filled(80, 60, 0.0), &intrinsics, &Affine3A::IDENTITY);
        assert_eq!(volume.observed_voxels(), 0);
    }

    #[test]
    fn test_extract_plane_points() {
        let intrinsics = Intrinsics::kinect(80, 60);
        let mut volume = small_volume();
        volume.integrate(&plane_depth(0.8), &intrinsics, &Affine3A::IDENTITY);

        let extraction = volume.extract_points(usize::MAX);
        assert!(!extraction.is_truncated());
        assert!(extraction.cloud.len() > 100);
        for point in &extraction.cloud.points {
            assert!((point.position.z - 0.8).abs() < 0.01, "{:?}", point.position);
            let n = point.normal.unwrap();
            assert!(n.dot(Vec3::NEG_Z) > 0.9, "{n:?}");
        }
    }

    #[test]
    fn test_extraction_capacity_and_reset() {
        let intrinsics = Intrinsics::kinect(80, 60);
        let mut volume = small_volume();
        volume.integrate(&plane_depth(0.8), &intrinsics, &Affine3A::IDENTITY);

        let full = volume.extract_points(usize::MAX);
        let capped = volume.extract_points(10);
        assert_eq!(capped.cloud.len(), 10);
        assert_eq!(capped.crossings, full.crossings);
        assert!(capped.is_truncated());
        assert_eq!(capped.cloud.points[..], full.cloud.points[..10]);

        volume.reset();
        assert_eq!(volume.observed_voxels(), 0);
        let empty = volume.extract_points(usize::MAX);
        assert!(empty.cloud.is_empty());
        assert_eq!(empty.crossings, 0);
    }

    #[test]
    fn test_sample_and_gradient_of_sphere() {
        let mut volume = small_volume();
        let center = Vec3::new(0.0, 0.0, 0.82);
        volume.fill_with_sdf(|p| (p - center).length() - 0.2);

        let on_surface = center + Vec3::new(0.2, 0.0, 0.0);
        let value = volume.sample(on_surface).unwrap();
        assert!(value.abs() < 0.05, "{value}");

        let g = volume.gradient(on_surface).unwrap().normalize();
        assert!(g.dot(Vec3::X) > 0.95);

        assert!(volume.contains(center));
        assert!(!volume.contains(Vec3::new(0.0, 0.0, 0.2)));
        assert!(volume.sample(Vec3::new(0.0, 0.0, 0.2)).is_none());
    }

    #[test]
    fn test_far_points_sample_as_none() {
        let mut volume = small_volume();
        volume.fill_with_sdf(|p| p.z - 0.8);

        assert!(volume.sample(Vec3::splat(1e12)).is_none());
        assert!(volume.sample(Vec3::splat(-1e12)).is_none());
        assert!(volume.sample(Vec3::new(0.0, 0.0, f32::MAX)).is_none());
        assert!(volume.gradient(Vec3::new(1e12, 0.0, 0.8)).is_none());
        assert!(volume.sample(Vec3::new(0.0, 0.0, 0.8)).is_some());
    }
}
