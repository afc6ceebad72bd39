//! Dense lookup tables and bilinear resampling.
//!
//! A [`TransformMap`] holds, for every output pixel, the source position to
//! sample in the camera frame. The extrinsic map treats each output pixel
//! `(i, j)` as the reference-plane point `(i, j, 0)` and stores where that
//! point is imaged, so resampling a camera frame through it yields a
//! rectified, top-down view of the plane.

use crate::camera::{RadTanModel, Resolution};
use crate::error::{CalibrationError, Result};
use crate::extrinsics::Pose;
use crate::transform::CoordinateTransformer;

use image::{GrayImage, Luma};
use log::info;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Source position for every pixel of a `width × height` output, stored
/// row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMap {
    pub width: u32,
    pub height: u32,
    pub points: Vec<[f32; 2]>,
}

impl TransformMap {
    /// Builds a map by evaluating `source` at every output pixel.
    pub fn from_fn(resolution: Resolution, mut source: impl FnMut(u32, u32) -> [f32; 2]) -> Self {
        let mut points = Vec::with_capacity(resolution.width as usize * resolution.height as usize);
        for j in 0..resolution.height {
            for i in 0..resolution.width {
                points.push(source(i, j));
            }
        }
        TransformMap {
            width: resolution.width,
            height: resolution.height,
            points,
        }
    }

    /// The map that samples every pixel from itself.
    pub fn identity(resolution: Resolution) -> Self {
        Self::from_fn(resolution, |i, j| [i as f32, j as f32])
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn get(&self, i: u32, j: u32) -> Option<[f32; 2]> {
        if i >= self.width || j >= self.height {
            return None;
        }
        self.points
            .get(j as usize * self.width as usize + i as usize)
            .copied()
    }

    /// Checks that the point count matches the dimensions.
    pub fn validate(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize;
        if self.points.len() != expected {
            return Err(CalibrationError::Persistence(format!(
                "map of {}x{} holds {} points, expected {}",
                self.width,
                self.height,
                self.points.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// Rebuilds the extrinsic map wholesale for a pose.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndistortionMapBuilder;

impl UndistortionMapBuilder {
    /// Map of `resolution` whose pixel `(i, j)` holds the image position of
    /// the plane point `(i, j, 0)` under `pose` and `lens`.
    pub fn rebuild(&self, resolution: Resolution, pose: &Pose, lens: &RadTanModel) -> TransformMap {
        info!(
            "Building {}x{} extrinsic map",
            resolution.width, resolution.height
        );
        let transformer = CoordinateTransformer::new(pose, lens);
        TransformMap::from_fn(resolution, |i, j| {
            let p = transformer.object_to_image(&Point2::new(i as f64, j as f64));
            [p.x as f32, p.y as f32]
        })
    }
}

/// Map that removes lens distortion while keeping the camera matrix: output
/// pixel `p` samples the distorted position of the ray through `K⁻¹ p`.
pub fn lens_undistortion_map(lens: &RadTanModel, resolution: Resolution) -> TransformMap {
    let i = lens.intrinsics;
    TransformMap::from_fn(resolution, |u, v| {
        let normalized = Vector2::new((u as f64 - i.cx) / i.fx, (v as f64 - i.cy) / i.fy);
        let p = lens.normalized_to_pixel(&normalized);
        [p.x as f32, p.y as f32]
    })
}

/// Resamples `frame` through `map` with bilinear interpolation. Samples that
/// fall outside the frame are black.
pub fn remap(frame: &GrayImage, map: &TransformMap) -> GrayImage {
    GrayImage::from_fn(map.width, map.height, |i, j| {
        let value = map
            .get(i, j)
            .and_then(|[x, y]| sample_bilinear(frame, x as f64, y as f64))
            .unwrap_or(0.0);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

fn sample_bilinear(frame: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (width, height) = frame.dimensions();
    if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
        return None;
    }
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    if width == 0 || height == 0 || x > max_x || y > max_y {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let at = |px: u32, py: u32| frame.get_pixel(px, py)[0] as f64;
    let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
    let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use nalgebra::Vector3;

    fn gradient() -> GrayImage {
        GrayImage::from_fn(40, 30, |x, y| Luma([(x * 3 + y * 2) as u8]))
    }

    #[test]
    fn test_identity_remap_reproduces_frame() {
        let frame = gradient();
        let map = TransformMap::identity(Resolution::new(40, 30));
        assert_eq!(remap(&frame, &map), frame);
    }

    #[test]
    fn test_remap_interpolates_and_blanks_outside() {
        let frame = gradient();
        let map = TransformMap::from_fn(Resolution::new(3, 1), |i, _| match i {
            0 => [0.5, 0.0],
            1 => [-1.0, 0.0],
            _ => [100.0, 5.0],
        });
        let out = remap(&frame, &map);
        // Halfway between 0 and 3.
        assert_eq!(out.get_pixel(0, 0)[0], 2);
        assert_eq!(out.get_pixel(1, 0)[0], 0);
        assert_eq!(out.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn test_map_validation() {
        let mut map = TransformMap::identity(Resolution::new(4, 3));
        assert!(map.validate().is_ok());
        assert_eq!(map.get(3, 2), Some([3.0, 2.0]));
        assert_eq!(map.get(4, 0), None);
        map.points.pop();
        assert!(matches!(map.validate(), Err(CalibrationError::Persistence(_))));
    }

    #[test]
    fn test_lens_map_without_distortion_is_identity() {
        let lens = RadTanModel::pinhole(
            Intrinsics {
                fx: 300.0,
                fy: 310.0,
                cx: 20.0,
                cy: 15.0,
            },
            Resolution::new(40, 30),
        );
        let map = lens_undistortion_map(&lens, Resolution::new(40, 30));
        let identity = TransformMap::identity(Resolution::new(40, 30));
        for (a, b) in map.points.iter().zip(identity.points.iter()) {
            assert!((a[0] - b[0]).abs() < 1e-3 && (a[1] - b[1]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rebuild_matches_forward_projection() {
        let lens = RadTanModel {
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 32.0,
                cy: 24.0,
            },
            resolution: Resolution::new(64, 48),
            distortions: [-0.1, 0.0, 0.0, 0.0, 0.0],
        };
        let pose = Pose::new(Vector3::new(0.05, 0.1, 0.0), Vector3::new(-30.0, -20.0, 400.0));
        let map = UndistortionMapBuilder.rebuild(Resolution::new(64, 48), &pose, &lens);
        assert_eq!(map.points.len(), 64 * 48);

        let transformer = CoordinateTransformer::new(&pose, &lens);
        let expected = transformer.object_to_image(&Point2::new(10.0, 7.0));
        let [x, y] = map.get(10, 7).unwrap();
        assert!((x as f64 - expected.x).abs() < 1e-3);
        assert!((y as f64 - expected.y).abs() < 1e-3);
    }
}
