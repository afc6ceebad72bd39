//! Implements the Radial-Tangential (RadTan) lens model used by the engine.
//!
//! This is the five-coefficient Brown-Conrady model: radial terms `k1, k2, k3`
//! and tangential terms `p1, p2`, applied to normalised image coordinates
//! before the camera matrix. The coefficient order `[k1, k2, p1, p2, k3]` is
//! the order used by the persisted intrinsics document.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance of the iterative undistortion.
const UNDISTORT_EPS: f64 = 1e-9;
const UNDISTORT_MAX_ITERATIONS: u32 = 100;

/// Pinhole camera with radial-tangential lens distortion.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use surface_calibration::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
///
/// let model = RadTanModel {
///     intrinsics: Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     resolution: Resolution { width: 640, height: 480 },
///     distortions: [0.1, -0.05, 0.001, 0.001, 0.0],
/// };
/// let pixel = model.project(&Vector3::new(0.1, -0.1, 1.0)).unwrap();
/// assert!(model.resolution.contains(pixel.x, pixel.y));
/// ```
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    pub distortions: [f64; 5], // k1, k2, p1, p2, k3
}

impl RadTanModel {
    /// Creates a model from `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// The resolution is initialised to 0x0 and should be set by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CameraModelError::InvalidParams`] when fewer than nine values
    /// are given, or the validation error of [`RadTanModel::validate_params`].
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "RadTan model needs 9 parameters, got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// An undistorted pinhole model with the given intrinsics.
    pub fn pinhole(intrinsics: Intrinsics, resolution: Resolution) -> Self {
        RadTanModel {
            intrinsics,
            resolution,
            distortions: [0.0; 5],
        }
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    /// Applies the lens distortion to a normalised image point.
    pub fn distort_normalized(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let x = point.x;
        let y = point.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Maps a normalised (undistorted) image point to pixel coordinates.
    pub fn normalized_to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let distorted = self.distort_normalized(point);
        Vector2::new(
            self.intrinsics.fx * distorted.x + self.intrinsics.cx,
            self.intrinsics.fy * distorted.y + self.intrinsics.cy,
        )
    }

    /// Removes the lens distortion from a pixel, returning the normalised
    /// image point `(x, y)` such that `normalized_to_pixel((x, y)) == pixel`.
    ///
    /// Solved with Newton iterations on the distortion polynomial, starting
    /// from the distorted normalised point.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let target = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        if k1 == 0.0 && k2 == 0.0 && p1 == 0.0 && p2 == 0.0 && k3 == 0.0 {
            return Ok(target);
        }

        let mut point = target;
        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let error = self.distort_normalized(&point) - target;
            if error.norm() < UNDISTORT_EPS {
                return Ok(point);
            }

            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            // d(radial)/d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);
            let Some(inv_jacobian) = jacobian.try_inverse() else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            };
            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < UNDISTORT_EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations.",
            UNDISTORT_MAX_ITERATIONS
        )))
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a camera-frame point to pixel coordinates.
    ///
    /// Points outside the image are returned as-is; only points on the
    /// camera plane (`z ≈ 0`) or behind it are rejected.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.normalized_to_pixel(&normalized))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let point = self.undistort_pixel(point_2d)?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            resolution: Resolution {
                width: 752,
                height: 480,
            },
            distortions: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        }
    }

    #[test]
    fn test_radtan_new_validates() {
        let params = DVector::from_vec(vec![
            500.0, 500.0, 320.0, 240.0, 0.1, -0.05, 0.001, 0.001, 0.02,
        ]);
        let model = RadTanModel::new(&params).unwrap();
        assert_eq!(model.intrinsics.fx, 500.0);
        assert_eq!(model.distortions[4], 0.02);
        assert_eq!(model.resolution.width, 0);

        let bad = DVector::from_vec(vec![
            -500.0, 500.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        assert!(RadTanModel::new(&bad).is_err());

        let short = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            RadTanModel::new(&short),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_radtan_project_undistort() {
        let model = sample_model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);

        let pixel = model.project(&point_3d).unwrap();
        assert!(model.resolution.contains(pixel.x, pixel.y));

        let normalized = model.undistort_pixel(&pixel).unwrap();
        assert_relative_eq!(normalized.x, 0.25, epsilon = 1e-6);
        assert_relative_eq!(normalized.y, -0.15, epsilon = 1e-6);

        let ray = model.unproject(&pixel).unwrap();
        let expected = point_3d.normalize();
        assert!(ray.dot(&expected) > 1.0 - 1e-9);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();
        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 1.0),
            Vector3::new(-0.5, 0.0, 1.0),
            Vector3::new(0.0, 0.4, 1.0),
            Vector3::new(0.3, 0.4, 1.0),
            Vector3::new(-0.3, -0.4, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for (i, original) in test_points.iter().enumerate() {
            let pixel = model.project(original).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            let dot = original.normalize().dot(&ray);
            assert!(
                dot > 0.9999,
                "Test point {}: direction mismatch, dot product {}",
                i,
                dot
            );
        }
    }

    #[test]
    fn test_project_rejects_camera_plane() {
        let model = sample_model();
        assert!(matches!(
            model.project(&Vector3::new(1.0, 1.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_pinhole_undistort_is_linear() {
        let model = RadTanModel::pinhole(
            Intrinsics {
                fx: 400.0,
                fy: 410.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution::new(640, 480),
        );
        let normalized = model.undistort_pixel(&Vector2::new(720.0, 650.0)).unwrap();
        assert_relative_eq!(normalized.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(normalized.y, 1.0, epsilon = 1e-12);
    }
}
