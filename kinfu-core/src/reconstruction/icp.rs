//! Coarse-to-fine projective point-to-plane ICP.
//!
//! Each live point is moved by the current estimate, projected into the model
//! view and paired with the model point at the nearest pixel. The 6x6 normal
//! equations of the linearized point-to-plane error are accumulated in f64
//! and solved with a Cholesky factorization; the solution `(ω, t)` is applied
//! as a left increment `T ← exp(ω), t · T`.

use crate::error::TrackingFailure;
use crate::ingest::{Intrinsics, Pyramid, PyramidLevel};
use crate::params::KinFuParams;
use glam::{Affine3A, Quat, Vec3};
use nalgebra::{Matrix6, Vector6};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Increments smaller than this end the iterations of a level early.
const CONVERGED: f64 = 1e-6;

/// Convergence summary of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingStats {
    pub level: usize,
    pub iterations: u32,
    pub correspondences: usize,
    /// RMS point-to-plane residual of the last iteration (metres).
    pub rms: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingResult {
    /// Live camera to model camera.
    pub transform: Affine3A,
    /// Per-level statistics, coarsest level first.
    pub stats: Vec<TrackingStats>,
    /// Inliers and RMS residual of the final estimate at the finest level.
    pub correspondences: usize,
    pub rms: f32,
}

/// Normal equations of the point-to-plane problem.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    ata: Matrix6<f64>,
    atb: Vector6<f64>,
    residual_sq: f64,
    count: usize,
}

impl Accumulator {
    fn zero() -> Self {
        Self {
            ata: Matrix6::zeros(),
            atb: Vector6::zeros(),
            residual_sq: 0.0,
            count: 0,
        }
    }

    #[inline]
    fn add(&mut self, point: Vec3, model_point: Vec3, model_normal: Vec3) {
        let r = model_normal.dot(point - model_point) as f64;
        let c = point.cross(model_normal);
        let j = Vector6::new(
            c.x as f64,
            c.y as f64,
            c.z as f64,
            model_normal.x as f64,
            model_normal.y as f64,
            model_normal.z as f64,
        );
        self.ata += j * j.transpose();
        self.atb += j * r;
        self.residual_sq += r * r;
        self.count += 1;
    }

    fn merge(mut self, other: Self) -> Self {
        self.ata += other.ata;
        self.atb += other.atb;
        self.residual_sq += other.residual_sq;
        self.count += other.count;
        self
    }

    fn rms(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.residual_sq / self.count as f64).sqrt() as f32
        }
    }
}

/// Ratio of the largest to the smallest singular value.
fn condition_number(matrix: &Matrix6<f64>) -> f64 {
    let svd = matrix.svd(false, false);
    let max = svd.singular_values.max();
    let min = svd.singular_values.min();
    if min <= max * f64::EPSILON {
        f64::INFINITY
    } else {
        max / min
    }
}

#[derive(Debug, Clone)]
pub struct PoseTracker {
    iterations: Vec<u32>,
    dist_threshold: f32,
    min_cos_angle: f32,
    min_correspondences: usize,
    max_condition: f64,
    max_rms: f32,
}

impl PoseTracker {
    pub fn new(params: &KinFuParams) -> Self {
        Self {
            iterations: params.icp_iterations.clone(),
            dist_threshold: params.icp_dist_threshold,
            min_cos_angle: params.icp_angle_threshold.cos(),
            min_correspondences: params.icp_min_correspondences,
            max_condition: params.icp_max_condition,
            max_rms: params.icp_max_rms,
        }
    }

    /// Align `live` to `model`, both in their own camera frames and taken with
    /// `intrinsics` at level 0. `guess` is the initial live-to-model transform.
    #[tracing::instrument(skip_all)]
    pub fn estimate_pose(
        &self,
        live: &Pyramid,
        model: &Pyramid,
        intrinsics: &Intrinsics,
        guess: &Affine3A,
    ) -> Result<TrackingResult, TrackingFailure> {
        let levels = live.len().min(model.len()).min(self.iterations.len());
        if levels == 0 {
            return Err(TrackingFailure::EmptyPyramid);
        }

        let mut transform = *guess;
        let mut stats = Vec::with_capacity(levels);

        for level in (0..levels).rev() {
            let live_level = &live.levels[level];
            let model_level = &model.levels[level];
            let k = intrinsics.level(level);
            let mut level_stats = TrackingStats {
                level,
                iterations: 0,
                correspondences: 0,
                rms: 0.0,
            };

            for _ in 0..self.iterations[level] {
                let acc = self.accumulate(live_level, model_level, &k, &transform);
                level_stats.iterations += 1;
                level_stats.correspondences = acc.count;
                level_stats.rms = acc.rms();

                if acc.count < self.min_correspondences {
                    warn!(
                        "ICP level {}: {} correspondences (need {})",
                        level, acc.count, self.min_correspondences
                    );
                    return Err(TrackingFailure::TooFewCorrespondences {
                        level,
                        found: acc.count,
                        required: self.min_correspondences,
                    });
                }

                let condition = condition_number(&acc.ata);
                if condition > self.max_condition {
                    return Err(TrackingFailure::IllConditioned { level, condition });
                }
                let Some(cholesky) = acc.ata.cholesky() else {
                    return Err(TrackingFailure::IllConditioned { level, condition });
                };
                let x = cholesky.solve(&(-acc.atb));
                if x.iter().any(|v| !v.is_finite()) {
                    return Err(TrackingFailure::NonFinite { level });
                }

                let omega = Vec3::new(x[0] as f32, x[1] as f32, x[2] as f32);
                let t = Vec3::new(x[3] as f32, x[4] as f32, x[5] as f32);
                let increment = Affine3A::from_rotation_translation(Quat::from_scaled_axis(omega), t);
                transform = increment * transform;

                if x.norm() < CONVERGED {
                    break;
                }
            }

            debug!(
                "ICP level {}: {} iterations, {} correspondences, rms {:.5}",
                level, level_stats.iterations, level_stats.correspondences, level_stats.rms
            );
            stats.push(level_stats);
        }

        let finest = self.accumulate(&live.levels[0], &model.levels[0], intrinsics, &transform);
        if finest.count < self.min_correspondences {
            return Err(TrackingFailure::TooFewCorrespondences {
                level: 0,
                found: finest.count,
                required: self.min_correspondences,
            });
        }
        let rms = finest.rms();
        if rms > self.max_rms {
            return Err(TrackingFailure::ResidualTooLarge {
                rms,
                limit: self.max_rms,
            });
        }

        Ok(TrackingResult {
            transform,
            stats,
            correspondences: finest.count,
            rms,
        })
    }

    /// Pair every valid live pixel with its projective model match and sum
    /// the normal equations, rows in parallel.
    fn accumulate(
        &self,
        live: &PyramidLevel,
        model: &PyramidLevel,
        k: &Intrinsics,
        transform: &Affine3A,
    ) -> Accumulator {
        let model_width = model.width() as i64;
        let model_height = model.height() as i64;
        let dist_sq = self.dist_threshold * self.dist_threshold;

        (0..live.height())
            .into_par_iter()
            .fold(Accumulator::zero, |mut acc, y| {
                for x in 0..live.width() {
                    let p = live.points.at(x, y);
                    let n = live.normals.at(x, y);
                    if !(p.is_finite() && n.is_finite()) {
                        continue;
                    }

                    let p = transform.transform_point3(p);
                    if p.z <= 0.0 {
                        continue;
                    }
                    let uv = k.project(p);
                    let u = uv.x.round() as i64;
                    let v = uv.y.round() as i64;
                    if u < 0 || v < 0 || u >= model_width || v >= model_height {
                        continue;
                    }

                    let pm = model.points.at(u as usize, v as usize);
                    let nm = model.normals.at(u as usize, v as usize);
                    if !(pm.is_finite() && nm.is_finite()) {
                        continue;
                    }
                    if (p - pm).length_squared() > dist_sq {
                        continue;
                    }
                    let n = transform.transform_vector3(n);
                    if n.dot(nm) < self.min_cos_angle {
                        continue;
                    }

                    acc.add(p, pm, nm);
                }
                acc
            })
            .reduce(Accumulator::zero, Accumulator::merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{DepthFrame, Preprocessor};
    use crate::synthetic::{Primitive, Scene, look_at};

    const W: usize = 160;
    const H: usize = 120;

    fn params() -> KinFuParams {
        let mut params = KinFuParams::default_params();
        params.cols = W;
        params.rows = H;
        params.intrinsics = Intrinsics::kinect(W, H);
        params
    }

    fn pyramid(scene: &Scene, pose: &Affine3A) -> Pyramid {
        let params = params();
        let frame = scene.render_depth(pose, &params.intrinsics, W, H);
        Preprocessor::new(&params).build_pyramid(&frame)
    }

    fn model_pose() -> Affine3A {
        look_at(Vec3::new(0.0, -0.4, 0.6), Vec3::new(0.0, 0.3, 2.0), Vec3::NEG_Y)
    }

    #[test]
    fn test_identity_alignment() {
        let scene = Scene::tabletop();
        let pose = model_pose();
        let model = pyramid(&scene, &pose);
        let tracker = PoseTracker::new(&params());

        let result = tracker
            .estimate_pose(&model, &model, &params().intrinsics, &Affine3A::IDENTITY)
            .unwrap();
        assert!(result.transform.abs_diff_eq(Affine3A::IDENTITY, 1e-4));
        assert!(result.rms < 1e-3);
        assert_eq!(result.stats.len(), 3);
        assert_eq!(result.stats[0].level, 2);
    }

    #[test]
    fn test_recovers_known_transform() {
        let scene = Scene::tabletop();
        let model_pose = model_pose();
        let motion = Affine3A::from_rotation_translation(
            Quat::from_euler(glam::EulerRot::YXZ, 1.5f32.to_radians(), -1.0f32.to_radians(), 0.5f32.to_radians()),
            Vec3::new(0.03, -0.02, 0.02),
        );
        let live_pose = model_pose * motion;

        let model = pyramid(&scene, &model_pose);
        let live = pyramid(&scene, &live_pose);
        let tracker = PoseTracker::new(&params());
        let result = tracker
            .estimate_pose(&live, &model, &params().intrinsics, &Affine3A::IDENTITY)
            .unwrap();

        let error = motion.inverse() * result.transform;
        let (_, rotation, translation) = error.to_scale_rotation_translation();
        assert!(translation.length() < 0.005, "translation error {translation:?}");
        assert!(rotation.angle_between(Quat::IDENTITY) < 0.3f32.to_radians());
        assert!(result.correspondences > 1000);
    }

    #[test]
    fn test_fails_without_overlap() {
        let scene = Scene::tabletop();
        let live = pyramid(&scene, &model_pose());

        // A model that only sees a 4x4 patch.
        let params = params();
        let mut data = vec![0u16; W * H];
        for y in 60..64 {
            for x in 80..84 {
                data[y * W + x] = 1500;
            }
        }
        let frame = DepthFrame::new(W, H, data).unwrap();
        let model = Preprocessor::new(&params).build_pyramid(&frame);

        let err = PoseTracker::new(&params)
            .estimate_pose(&live, &model, &params.intrinsics, &Affine3A::IDENTITY)
            .unwrap_err();
        assert!(matches!(err, TrackingFailure::TooFewCorrespondences { .. }));
    }

    #[test]
    fn test_single_plane_is_ill_conditioned() {
        let scene = Scene::new().with(Primitive::Plane {
            point: Vec3::new(0.0, 0.0, 1.5),
            normal: Vec3::NEG_Z,
        });
        let pose = Affine3A::IDENTITY;
        let model = pyramid(&scene, &pose);
        let params = params();

        let err = PoseTracker::new(&params)
            .estimate_pose(&model, &model, &params.intrinsics, &Affine3A::IDENTITY)
            .unwrap_err();
        assert!(matches!(err, TrackingFailure::IllConditioned { .. }));
    }

    #[test]
    fn test_empty_pyramid() {
        let params = params();
        let err = PoseTracker::new(&params)
            .estimate_pose(&Pyramid::default(), &Pyramid::default(), &params.intrinsics, &Affine3A::IDENTITY)
            .unwrap_err();
        assert_eq!(err, TrackingFailure::EmptyPyramid);
    }
}
