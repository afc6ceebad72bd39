//! The `optimization` module refines the lens model and board poses.
//!
//! Two cost structures implement the [`Optimizer`] trait:
//!
//! * [`PlanarCalibrationCost`] fits the intrinsics, the distortion and one
//!   pose per view from several views of a planar pattern.
//! * [`PoseRefinementCost`] fits a single board pose with the lens model held
//!   fixed.
//!
//! Both follow the same two steps: a closed-form linear estimation from plane
//! homographies, then Levenberg-Marquardt refinement with `tiny_solver`.
//! The residual functions are generic over [`nalgebra::RealField`] so the
//! solver can differentiate them automatically.

use nalgebra::RealField;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod planar;
pub mod pose;

pub use planar::{PlanarCalibrationCost, PlanarView, ViewPose};
pub use pose::{planar_pose_from_points, PoseRefinementCost};

use crate::camera::{CameraModelError, Intrinsics, Resolution};

/// Summary statistics of a set of reprojection distances, in pixels.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Statistics of `errors`, or `None` when there are none.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {:.4}, min: {:.4}, max: {:.4}, mean: {:.4}, stddev: {:.4}, median: {:.4} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// A trait for camera calibration optimization tasks.
///
/// Implementors own their correspondences and the model being refined.
/// `linear_estimation` seeds the parameters, `optimize` refines them.
pub trait Optimizer {
    /// Refines the parameters by minimizing the pixel reprojection error.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, the optimizer logs progress at `info` level.
    ///
    /// # Errors
    ///
    /// Returns [`CameraModelError`] for invalid input, a solver that fails to
    /// converge, or refined parameters that do not validate.
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError>;

    /// Closed-form initial estimate of the parameters.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError>
    where
        Self: Sized;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Rotates `p` by the Rodrigues vector `rvec`.
pub(crate) fn rotate_point<T: RealField>(rvec: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let [rx, ry, rz] = rvec.clone();
    let [px, py, pz] = p.clone();

    let cross = |ax: T, ay: T, az: T| {
        [
            ay.clone() * pz.clone() - az.clone() * py.clone(),
            az * px.clone() - ax.clone() * pz.clone(),
            ax * py.clone() - ay * px.clone(),
        ]
    };

    let theta2 = rx.clone() * rx.clone() + ry.clone() * ry.clone() + rz.clone() * rz.clone();
    if theta2 < nalgebra::convert::<f64, T>(1e-12) {
        // First order: R ≈ I + [r]x
        let c = cross(rx, ry, rz);
        return [
            px + c[0].clone(),
            py + c[1].clone(),
            pz + c[2].clone(),
        ];
    }

    let theta = theta2.sqrt();
    let (sin, cos) = (theta.clone().sin(), theta.clone().cos());
    let kx = rx / theta.clone();
    let ky = ry / theta.clone();
    let kz = rz / theta;
    let k_dot_p = kx.clone() * px.clone() + ky.clone() * py.clone() + kz.clone() * pz.clone();
    let one_minus_cos = T::one() - cos.clone();
    let c = cross(kx.clone(), ky.clone(), kz.clone());

    let along_x = kx * k_dot_p.clone() * one_minus_cos.clone();
    let along_y = ky * k_dot_p.clone() * one_minus_cos.clone();
    let along_z = kz * k_dot_p * one_minus_cos;
    [
        px * cos.clone() + c[0].clone() * sin.clone() + along_x,
        py * cos.clone() + c[1].clone() * sin.clone() + along_y,
        pz * cos + c[2].clone() * sin + along_z,
    ]
}

/// Projects an object point through a pose, the lens distortion
/// `[k1, k2, p1, p2, k3]` and the camera matrix `[fx, fy, cx, cy]`.
pub(crate) fn project_point<T: RealField>(
    intrinsics: &[T; 4],
    distortion: &[T; 5],
    rvec: &[T; 3],
    tvec: &[T; 3],
    object: &[f64; 3],
) -> [T; 2] {
    let p = [
        nalgebra::convert::<f64, T>(object[0]),
        nalgebra::convert::<f64, T>(object[1]),
        nalgebra::convert::<f64, T>(object[2]),
    ];
    let [x, y, z] = rotate_point(rvec, &p);
    let x = x + tvec[0].clone();
    let y = y + tvec[1].clone();
    let z = z + tvec[2].clone();

    let xn = x / z.clone();
    let yn = y / z;

    let [k1, k2, p1, p2, k3] = distortion.clone();
    let two = nalgebra::convert::<f64, T>(2.0);
    let r2 = xn.clone() * xn.clone() + yn.clone() * yn.clone();
    let r4 = r2.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4.clone() + k3 * r4 * r2.clone();
    let xy = xn.clone() * yn.clone();
    let xd = xn.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * xn.clone() * xn);
    let yd = yn.clone() * radial + p1 * (r2 + two.clone() * yn.clone() * yn) + two * p2 * xy;

    let [fx, fy, cx, cy] = intrinsics.clone();
    [fx * xd + cx, fy * yd + cy]
}
