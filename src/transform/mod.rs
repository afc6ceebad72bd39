//! Mapping between camera pixels and the `z = 0` reference plane.
//!
//! `object_to_image` is the full forward projection including lens
//! distortion. `image_to_object` intersects the pinhole ray of a pixel with
//! the plane and does not remove distortion, so the two are inverse only up
//! to the distortion at that pixel.

use crate::camera::RadTanModel;
use crate::error::{CalibrationError, Result};
use crate::extrinsics::Pose;

use nalgebra::{Matrix3, Point2, Vector2, Vector3};

/// Denominators below this make the pixel ray parallel to the plane.
const PARALLEL_EPS: f64 = 1e-12;

/// A pose and lens model prepared for repeated mapping.
#[derive(Debug, Clone)]
pub struct CoordinateTransformer {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    lens: RadTanModel,
    k_inv: Matrix3<f64>,
}

impl CoordinateTransformer {
    pub fn new(pose: &Pose, lens: &RadTanModel) -> Self {
        let i = &lens.intrinsics;
        let k_inv = Matrix3::new(
            1.0 / i.fx, 0.0, -i.cx / i.fx, //
            0.0, 1.0 / i.fy, -i.cy / i.fy, //
            0.0, 0.0, 1.0,
        );
        CoordinateTransformer {
            rotation: pose.rotation_matrix(),
            translation: pose.tvec,
            lens: *lens,
            k_inv,
        }
    }

    /// Point on the reference plane seen at `pixel`.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::DegenerateGeometry`] when the pixel ray is parallel
    /// to the plane.
    pub fn image_to_object(&self, pixel: &Point2<f64>) -> Result<Point2<f64>> {
        let r_inv = self.rotation.transpose();
        let ray = self.k_inv * Vector3::new(pixel.x, pixel.y, 1.0);
        let ray_object = r_inv * ray;
        let t_object = r_inv * self.translation;

        if ray_object.z.abs() < PARALLEL_EPS {
            return Err(CalibrationError::DegenerateGeometry(format!(
                "ray through ({}, {}) is parallel to the reference plane",
                pixel.x, pixel.y
            )));
        }
        let scale = t_object.z / ray_object.z;
        let point = r_inv * (ray * scale - self.translation);
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(CalibrationError::DegenerateGeometry(format!(
                "no finite plane point for ({}, {})",
                pixel.x, pixel.y
            )));
        }
        Ok(Point2::new(point.x, point.y))
    }

    /// Pixel at which the plane point `point` is imaged.
    pub fn object_to_image(&self, point: &Point2<f64>) -> Point2<f64> {
        let camera = self.rotation * Vector3::new(point.x, point.y, 0.0) + self.translation;
        let inv_z = if camera.z.abs() > f64::EPSILON {
            1.0 / camera.z
        } else {
            1.0
        };
        let pixel = self
            .lens
            .normalized_to_pixel(&Vector2::new(camera.x * inv_z, camera.y * inv_z));
        Point2::new(pixel.x, pixel.y)
    }
}

/// See [`CoordinateTransformer::image_to_object`].
pub fn image_to_object(
    pixel: &Point2<f64>,
    pose: &Pose,
    lens: &RadTanModel,
) -> Result<Point2<f64>> {
    CoordinateTransformer::new(pose, lens).image_to_object(pixel)
}

/// See [`CoordinateTransformer::object_to_image`].
pub fn object_to_image(point: &Point2<f64>, pose: &Pose, lens: &RadTanModel) -> Point2<f64> {
    CoordinateTransformer::new(pose, lens).object_to_image(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use approx::assert_relative_eq;

    fn lens(distortions: [f64; 5]) -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 590.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution::new(640, 480),
            distortions,
        }
    }

    fn pose() -> Pose {
        Pose::new(
            Vector3::new(0.3, -0.2, 0.1),
            Vector3::new(-80.0, -40.0, 600.0),
        )
    }

    #[test]
    fn test_round_trip_without_distortion() {
        let lens = lens([0.0; 5]);
        let transformer = CoordinateTransformer::new(&pose(), &lens);
        for (u, v) in [(320.0, 240.0), (10.0, 20.0), (600.0, 460.0), (100.0, 400.0)] {
            let pixel = Point2::new(u, v);
            let object = transformer.image_to_object(&pixel).unwrap();
            let back = transformer.object_to_image(&object);
            assert_relative_eq!(back, pixel, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_object_round_trip_without_distortion() {
        let lens = lens([0.0; 5]);
        let object = Point2::new(37.5, 12.5);
        let pixel = object_to_image(&object, &pose(), &lens);
        let back = image_to_object(&pixel, &pose(), &lens).unwrap();
        assert_relative_eq!(back, object, epsilon = 1e-6);
    }

    #[test]
    fn test_distortion_only_forward() {
        let undistorted = lens([0.0; 5]);
        let distorted = lens([-0.2, 0.05, 0.0, 0.0, 0.0]);
        let object = Point2::new(150.0, 100.0);
        let a = object_to_image(&object, &pose(), &undistorted);
        let b = object_to_image(&object, &pose(), &distorted);
        assert!((a - b).norm() > 0.1);
        // Same pinhole ray either way.
        assert_relative_eq!(
            image_to_object(&a, &pose(), &undistorted).unwrap(),
            image_to_object(&a, &pose(), &distorted).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_parallel_ray_is_degenerate() {
        // Camera looking along the plane: optical axis lies in z = 0.
        let pose = Pose::new(
            Vector3::new(std::f64::consts::FRAC_PI_2, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 100.0),
        );
        let lens = lens([0.0; 5]);
        let result = image_to_object(&Point2::new(320.0, 240.0), &pose, &lens);
        assert!(matches!(result, Err(CalibrationError::DegenerateGeometry(_))));
    }

    #[test]
    fn test_object_to_image_at_camera_plane_is_finite() {
        let pose = Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.0));
        let pixel = object_to_image(&Point2::new(0.01, 0.02), &pose, &lens([0.0; 5]));
        assert!(pixel.x.is_finite() && pixel.y.is_finite());
    }
}
