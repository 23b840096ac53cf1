//! Depth preprocessing: unit conversion, bilateral smoothing and the
//! multi-resolution point/normal pyramid consumed by the pose tracker.

use crate::ingest::camera::Intrinsics;
use crate::ingest::depth::{DepthFrame, DepthMap, Map2D, NormalMap, PointMap};
use crate::params::KinFuParams;
use glam::Vec3;
use rayon::prelude::*;
use tracing::debug;

/// One resolution level: depth in metres plus camera-frame points and normals.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub depth: DepthMap,
    pub points: PointMap,
    pub normals: NormalMap,
    pub intrinsics: Intrinsics,
}

impl PyramidLevel {
    pub fn width(&self) -> usize {
        self.points.width()
    }

    pub fn height(&self) -> usize {
        self.points.height()
    }

    /// Pixels with both a valid point and a valid normal.
    pub fn valid_count(&self) -> usize {
        self.points
            .data()
            .iter()
            .zip(self.normals.data())
            .filter(|(p, n)| p.is_finite() && n.is_finite())
            .count()
    }
}

/// Levels ordered finest first; each level halves the resolution of the previous one.
#[derive(Debug, Clone, Default)]
pub struct Pyramid {
    pub levels: Vec<PyramidLevel>,
}

impl Pyramid {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, level: usize) -> Option<&PyramidLevel> {
        self.levels.get(level)
    }

    /// Build a pyramid from full-resolution point and normal maps (a ray-cast
    /// view of the model). Coarser levels average 2x2 blocks; a block with any
    /// invalid entry is invalid.
    pub fn from_point_normal_maps(
        points: PointMap,
        normals: NormalMap,
        intrinsics: &Intrinsics,
        levels: usize,
    ) -> Self {
        let mut out = Vec::with_capacity(levels);
        let mut current = (points, normals);

        for level in 0..levels {
            let (points, normals) = current;
            let depth = Map2D::from_parts(
                points.width(),
                points.height(),
                points
                    .data()
                    .iter()
                    .map(|p| if p.is_finite() { p.z } else { 0.0 })
                    .collect(),
            );

            let next = if level + 1 < levels {
                Some((
                    downsample_vectors(&points, false),
                    downsample_vectors(&normals, true),
                ))
            } else {
                None
            };

            out.push(PyramidLevel {
                depth,
                points,
                normals,
                intrinsics: intrinsics.level(level),
            });

            match next {
                Some(maps) => current = maps,
                None => break,
            }
        }

        Self { levels: out }
    }
}

/// Turns raw sensor frames into pyramids.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    intrinsics: Intrinsics,
    levels: usize,
    min_depth: f32,
    max_depth: f32,
    kernel_size: usize,
    sigma_spatial: f32,
    sigma_depth: f32,
}

impl Preprocessor {
    pub fn new(params: &KinFuParams) -> Self {
        Self {
            intrinsics: params.intrinsics,
            levels: params.pyramid_levels(),
            min_depth: params.min_depth,
            max_depth: params.max_depth,
            kernel_size: params.bilateral_kernel_size,
            sigma_spatial: params.bilateral_sigma_spatial,
            sigma_depth: params.bilateral_sigma_depth,
        }
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// Millimetres to metres with the configured depth range applied.
    pub fn scale_depth(&self, frame: &DepthFrame) -> DepthMap {
        frame.to_meters(self.min_depth, self.max_depth)
    }

    /// Full preprocessing of a raw frame.
    #[tracing::instrument(skip_all)]
    pub fn build_pyramid(&self, frame: &DepthFrame) -> Pyramid {
        let depth = self.scale_depth(frame);
        self.pyramid_from_depth(&depth)
    }

    /// Preprocess an already range-checked metric depth map.
    pub fn pyramid_from_depth(&self, depth: &DepthMap) -> Pyramid {
        let filtered = self.bilateral_filter(depth);

        let mut levels = Vec::with_capacity(self.levels);
        let mut current = filtered;
        for level in 0..self.levels {
            let intrinsics = self.intrinsics.level(level);
            let points = compute_points(&current, &intrinsics);
            let normals = compute_normals(&points);
            let next = if level + 1 < self.levels {
                Some(downsample_depth(&current))
            } else {
                None
            };

            levels.push(PyramidLevel {
                depth: current,
                points,
                normals,
                intrinsics,
            });

            match next {
                Some(depth) => current = depth,
                None => break,
            }
        }

        let pyramid = Pyramid { levels };
        debug!(
            "Pyramid built: {} levels, {} valid pixels at level 0",
            pyramid.len(),
            pyramid.level(0).map_or(0, |l| l.valid_count())
        );
        pyramid
    }

    /// Edge-preserving smoothing. Only valid neighbours contribute and invalid
    /// pixels stay invalid.
    pub fn bilateral_filter(&self, depth: &DepthMap) -> DepthMap {
        let width = depth.width();
        let height = depth.height();
        let radius = (self.kernel_size / 2) as isize;
        let inv_spatial = 1.0 / (2.0 * self.sigma_spatial * self.sigma_spatial);
        let inv_depth = 1.0 / (2.0 * self.sigma_depth * self.sigma_depth);

        let mut out = vec![0.0f32; width * height];
        out.par_chunks_mut(width.max(1))
            .enumerate()
            .for_each(|(y, row)| {
                for (x, value) in row.iter_mut().enumerate() {
                    let center = depth.at(x, y);
                    if center <= 0.0 {
                        continue;
                    }

                    let mut sum = 0.0;
                    let mut total = 0.0;
                    for dy in -radius..=radius {
                        let ny = y as isize + dy;
                        if ny < 0 || ny >= height as isize {
                            continue;
                        }
                        for dx in -radius..=radius {
                            let nx = x as isize + dx;
                            if nx < 0 || nx >= width as isize {
                                continue;
                            }
                            let d = depth.at(nx as usize, ny as usize);
                            if d <= 0.0 {
                                continue;
                            }
                            let spatial = (dx * dx + dy * dy) as f32 * inv_spatial;
                            let range = (d - center) * (d - center) * inv_depth;
                            let w = (-spatial - range).exp();
                            sum += w * d;
                            total += w;
                        }
                    }
                    *value = sum / total;
                }
            });

        Map2D::from_parts(width, height, out)
    }
}

/// Back-project every valid depth pixel.
pub fn compute_points(depth: &DepthMap, intrinsics: &Intrinsics) -> PointMap {
    let width = depth.width();
    let mut out = vec![Vec3::NAN; width * depth.height()];
    out.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, p) in row.iter_mut().enumerate() {
                let d = depth.at(x, y);
                if d > 0.0 {
                    *p = intrinsics.back_project(x as f32, y as f32, d);
                }
            }
        });
    Map2D::from_parts(width, depth.height(), out)
}

/// Forward-difference normals oriented toward the camera. The last row and
/// column, and pixels next to an invalid point, get no normal.
pub fn compute_normals(points: &PointMap) -> NormalMap {
    let width = points.width();
    let height = points.height();
    let mut out = vec![Vec3::NAN; width * height];
    out.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            if y + 1 >= height {
                return;
            }
            for (x, n) in row.iter_mut().enumerate().take(width.saturating_sub(1)) {
                let p = points.at(x, y);
                let px = points.at(x + 1, y);
                let py = points.at(x, y + 1);
                if !(p.is_finite() && px.is_finite() && py.is_finite()) {
                    continue;
                }
                let normal = (px - p).cross(py - p).normalize_or_zero();
                if normal == Vec3::ZERO {
                    continue;
                }
                *n = if normal.dot(p) > 0.0 { -normal } else { normal };
            }
        });
    Map2D::from_parts(width, height, out)
}

/// Halve the resolution by 2x2 block averaging; any invalid pixel in a block
/// invalidates the coarse pixel.
pub fn downsample_depth(depth: &DepthMap) -> DepthMap {
    let width = depth.width() / 2;
    let height = depth.height() / 2;
    Map2D::from_fn(width, height, |x, y| {
        let block = [
            depth.at(2 * x, 2 * y),
            depth.at(2 * x + 1, 2 * y),
            depth.at(2 * x, 2 * y + 1),
            depth.at(2 * x + 1, 2 * y + 1),
        ];
        if block.iter().any(|&d| d <= 0.0) {
            0.0
        } else {
            block.iter().sum::<f32>() / 4.0
        }
    })
}

fn downsample_vectors(map: &Map2D<Vec3>, normalize: bool) -> Map2D<Vec3> {
    let width = map.width() / 2;
    let height = map.height() / 2;
    Map2D::from_fn(width, height, |x, y| {
        let block = [
            map.at(2 * x, 2 * y),
            map.at(2 * x + 1, 2 * y),
            map.at(2 * x, 2 * y + 1),
            map.at(2 * x + 1, 2 * y + 1),
        ];
        if block.iter().any(|v| !v.is_finite()) {
            return Vec3::NAN;
        }
        let mean = block.iter().copied().sum::<Vec3>() / 4.0;
        if normalize {
            let n = mean.normalize_or_zero();
            if n == Vec3::ZERO { Vec3::NAN } else { n }
        } else {
            mean
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(cols: usize, rows: usize) -> KinFuParams {
        let mut params = KinFuParams::default_params();
        params.cols = cols;
        params.rows = rows;
        params.intrinsics = Intrinsics::kinect(cols, rows);
        params
    }

    fn flat_frame(cols: usize, rows: usize, mm: u16) -> DepthFrame {
        DepthFrame::filled(cols, rows, mm)
    }

    #[test]
    fn test_fronto_parallel_plane() {
        let pre = Preprocessor::new(&params(64, 48));
        let pyramid = pre.build_pyramid(&flat_frame(64, 48, 1500));

        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid.levels[1].width(), 32);
        assert_eq!(pyramid.levels[2].height(), 12);

        let level = &pyramid.levels[0];
        let p = level.points.at(10, 10);
        assert!((p.z - 1.5).abs() < 1e-5);
        let n = level.normals.at(10, 10);
        assert!((n - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-4);
        // Last column has no right neighbour.
        assert!(level.normals.at(63, 10).is_nan());
        assert!(level.points.at(63, 10).is_finite());
    }

    #[test]
    fn test_out_of_range_depth_is_invalid() {
        let pre = Preprocessor::new(&params(16, 16));
        let mut data = vec![1000u16; 256];
        data[5 * 16 + 5] = 100; // closer than min_depth
        data[6 * 16 + 6] = 9000; // farther than max_depth
        let pyramid = pre.build_pyramid(&DepthFrame::new(16, 16, data).unwrap());
        let level = &pyramid.levels[0];

        assert_eq!(level.depth.at(5, 5), 0.0);
        assert!(level.points.at(5, 5).is_nan());
        assert!(level.points.at(6, 6).is_nan());
        // Neighbours of invalid pixels lose their normal.
        assert!(level.normals.at(4, 5).is_nan());
        assert!(level.normals.at(5, 4).is_nan());
        assert!(level.normals.at(2, 2).is_finite());
    }

    #[test]
    fn test_bilateral_preserves_discontinuity() {
        let pre = Preprocessor::new(&params(32, 8));
        let depth = DepthMap::from_fn(32, 8, |x, _| if x < 16 { 1.0 } else { 2.0 });
        let filtered = pre.bilateral_filter(&depth);

        // A 1 m step is 25 range sigmas; the sides must not bleed into each other.
        assert!((filtered.at(15, 4) - 1.0).abs() < 1e-4);
        assert!((filtered.at(16, 4) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_bilateral_smooths_noise_and_skips_invalid() {
        let pre = Preprocessor::new(&params(16, 16));
        let depth = DepthMap::from_fn(16, 16, |x, y| {
            if (x, y) == (3, 3) {
                0.0
            } else if (x + y) % 2 == 0 {
                1.01
            } else {
                0.99
            }
        });
        let filtered = pre.bilateral_filter(&depth);

        assert_eq!(filtered.at(3, 3), 0.0);
        let v = filtered.at(8, 8);
        assert!((v - 1.0).abs() < 0.005, "filtered value {v}");
        assert!(filtered.at(4, 3) > 0.9);
    }

    #[test]
    fn test_downsample_invalidates_partial_blocks() {
        let depth = DepthMap::new(4, 2, vec![1.0, 1.2, 2.0, 0.0, 1.4, 1.6, 2.0, 2.0]).unwrap();
        let coarse = downsample_depth(&depth);
        assert_eq!(coarse.width(), 2);
        assert_eq!(coarse.height(), 1);
        assert!((coarse.at(0, 0) - 1.3).abs() < 1e-6);
        assert_eq!(coarse.at(1, 0), 0.0);
    }

    #[test]
    fn test_model_pyramid_from_maps() {
        let k = Intrinsics::kinect(8, 8);
        let points = PointMap::from_fn(8, 8, |x, y| {
            if x == 0 && y == 0 {
                Vec3::NAN
            } else {
                k.back_project(x as f32, y as f32, 2.0)
            }
        });
        let normals = NormalMap::filled(8, 8, Vec3::NEG_Z);
        let pyramid = Pyramid::from_point_normal_maps(points, normals, &k, 3);

        assert_eq!(pyramid.len(), 3);
        let l1 = &pyramid.levels[1];
        assert!(l1.points.at(0, 0).is_nan());
        assert!((l1.points.at(1, 1).z - 2.0).abs() < 1e-5);
        assert!((l1.depth.at(1, 1) - 2.0).abs() < 1e-5);
        assert_eq!(l1.normals.at(1, 1), Vec3::NEG_Z);
        assert_eq!(pyramid.levels[2].width(), 2);
        // The averaged point lies on the ray of the coarse pixel.
        let expected = l1.intrinsics.back_project(1.0, 1.0, 2.0);
        assert!((l1.points.at(1, 1) - expected).length() < 1e-5);
    }
}
