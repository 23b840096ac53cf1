//! Row-major 2D maps: raw depth frames, metric depth maps, point and normal maps.

use crate::error::KinFuError;
use glam::Vec3;

/// Dense row-major image of `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Map2D<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

/// Raw sensor depth in millimetres, 0 = no reading.
pub type DepthFrame = Map2D<u16>;
/// Depth in metres, 0 = invalid.
pub type DepthMap = Map2D<f32>;
/// Camera-frame points, `Vec3::NAN` = invalid.
pub type PointMap = Map2D<Vec3>;
/// Camera-frame unit normals, `Vec3::NAN` = invalid.
pub type NormalMap = Map2D<Vec3>;

impl<T> Map2D<T> {
    /// Wrap a row-major buffer; fails when its length is not `width * height`.
    pub fn new(width: usize, height: usize, data: Vec<T>) -> Result<Self, KinFuError> {
        let expected = width * height;
        if data.len() != expected {
            return Err(KinFuError::DataLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub(crate) fn from_parts(width: usize, height: usize, data: Vec<T>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::from_parts(width, height, data)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn row(&self, y: usize) -> &[T] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<&T> {
        if x < self.width && y < self.height {
            self.data.get(y * self.width + x)
        } else {
            None
        }
    }
}

impl<T: Clone> Map2D<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self::from_parts(width, height, vec![value; width * height])
    }
}

impl<T: Copy> Map2D<T> {
    /// Value at `(x, y)`; the caller guarantees the coordinates are in range.
    #[inline]
    pub(crate) fn at(&self, x: usize, y: usize) -> T {
        self.data[y * self.width + x]
    }
}

impl DepthFrame {
    /// Quantize a metric depth map to millimetres; invalid entries become 0.
    pub fn from_meters(depth: &DepthMap) -> Self {
        let data = depth
            .data()
            .iter()
            .map(|&d| {
                if d.is_finite() && d > 0.0 {
                    (d * 1000.0).round().min(u16::MAX as f32) as u16
                } else {
                    0
                }
            })
            .collect();
        Self::from_parts(depth.width(), depth.height(), data)
    }

    /// Convert to metres, discarding readings outside `[min_depth, max_depth]`.
    pub fn to_meters(&self, min_depth: f32, max_depth: f32) -> DepthMap {
        let data = self
            .data
            .iter()
            .map(|&mm| {
                let d = mm as f32 / 1000.0;
                if mm != 0 && d >= min_depth && d <= max_depth {
                    d
                } else {
                    0.0
                }
            })
            .collect();
        DepthMap::from_parts(self.width, self.height, data)
    }

    /// Number of pixels carrying a reading.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&mm| mm != 0).count()
    }
}
