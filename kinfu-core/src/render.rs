//! Images for display: shaded model views and raw depth previews.

use crate::ingest::DepthFrame;
use crate::scene::Raycast;
use glam::Vec3;
use image::{GrayImage, Luma, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// Depth mapped to full white in previews (millimetres).
pub const PREVIEW_RANGE_MM: f32 = 4000.0;

const AMBIENT: f32 = 0.2;
const DIFFUSE: f32 = 0.8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Lambertian shading from a point light.
    #[default]
    Shaded,
    /// Camera-frame normals mapped to RGB.
    Normals,
    /// Ray-cast depth as gray levels.
    Depth,
}

/// Colour a ray cast. `light` is in world coordinates; pixels without a hit
/// stay black.
pub fn render_raycast(raycast: &Raycast, mode: RenderMode, light: Vec3) -> RgbaImage {
    let light_cam = raycast.pose.inverse().transform_point3(light);
    let width = raycast.width() as u32;
    let height = raycast.height() as u32;

    RgbaImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let p = raycast.points.at(x, y);
        let n = raycast.normals.at(x, y);
        if !(p.is_finite() && n.is_finite()) {
            return Rgba([0, 0, 0, 255]);
        }

        match mode {
            RenderMode::Shaded => {
                let l = (light_cam - p).normalize_or_zero();
                let intensity = AMBIENT + DIFFUSE * n.dot(l).max(0.0);
                let v = to_u8(intensity);
                Rgba([v, v, v, 255])
            }
            RenderMode::Normals => {
                let c = n * 0.5 + 0.5;
                Rgba([to_u8(c.x), to_u8(c.y), to_u8(c.z), 255])
            }
            RenderMode::Depth => {
                let v = to_u8(raycast.depth.at(x, y) * 1000.0 / PREVIEW_RANGE_MM);
                Rgba([v, v, v, 255])
            }
        }
    })
}

/// 8-bit view of a raw depth frame, scaled so 4 m is white.
pub fn depth_preview(frame: &DepthFrame) -> GrayImage {
    GrayImage::from_fn(frame.width() as u32, frame.height() as u32, |x, y| {
        let mm = frame.at(x as usize, y as usize) as f32;
        Luma([to_u8(mm / PREVIEW_RANGE_MM)])
    })
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{DepthMap, Intrinsics, Map2D};
    use glam::Affine3A;

    fn wall_raycast() -> Raycast {
        let k = Intrinsics::kinect(8, 6);
        let points = Map2D::from_fn(8, 6, |x, y| {
            if x == 0 {
                Vec3::NAN
            } else {
                k.back_project(x as f32, y as f32, 2.0)
            }
        });
        let normals = Map2D::from_fn(8, 6, |x, _| if x == 0 { Vec3::NAN } else { Vec3::NEG_Z });
        let depth = DepthMap::from_fn(8, 6, |x, _| if x == 0 { 0.0 } else { 2.0 });
        Raycast {
            depth,
            points,
            normals,
            pose: Affine3A::IDENTITY,
            intrinsics: k,
        }
    }

    #[test]
    fn test_shaded_render() {
        let raycast = wall_raycast();
        let image = render_raycast(&raycast, RenderMode::Shaded, Vec3::ZERO);
        assert_eq!(image.dimensions(), (8, 6));
        assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        // Light at the camera: nearly head-on lighting near the centre.
        assert!(image.get_pixel(4, 3)[0] > 240);

        // Light behind the wall leaves only the ambient term.
        let dark = render_raycast(&raycast, RenderMode::Shaded, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(dark.get_pixel(4, 3)[0], to_u8(AMBIENT));
    }

    #[test]
    fn test_normal_and_depth_modes() {
        let raycast = wall_raycast();
        let normals = render_raycast(&raycast, RenderMode::Normals, Vec3::ZERO);
        assert_eq!(normals.get_pixel(3, 3), &Rgba([128, 128, 0, 255]));

        let depth = render_raycast(&raycast, RenderMode::Depth, Vec3::ZERO);
        assert_eq!(depth.get_pixel(3, 3)[0], 128);
    }

    #[test]
    fn test_depth_preview_scaling() {
        let frame = DepthFrame::new(3, 1, vec![0, 2000, 8000]).unwrap();
        let preview = depth_preview(&frame);
        assert_eq!(preview.get_pixel(0, 0)[0], 0);
        assert_eq!(preview.get_pixel(1, 0)[0], 128);
        assert_eq!(preview.get_pixel(2, 0)[0], 255);
    }
}
