//! Multi-view calibration of the radial-tangential model from a planar
//! pattern.
//!
//! The parameter blocks handed to `tiny_solver` are `"intrinsics"`
//! (`fx, fy, cx, cy`), `"distortion"` (`k1, k2, p1, p2`) and one `"pose_{i}"`
//! block (`rx, ry, rz, tx, ty, tz`) per view. `k3` is held at zero. With fewer
//! than [`FULL_MODEL_MIN_VIEWS`] views only the focal lengths and the poses
//! are refined; the principal point stays at the image centre and the lens is
//! treated as distortion free.

use crate::camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
use crate::geometry::{find_homography, planar_pose_from_homography, vector_from_rotation};
use crate::optimization::{project_point, Optimizer};

use log::{debug, info};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, RealField, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Views needed before the principal point and distortion are refined.
pub const FULL_MODEL_MIN_VIEWS: usize = 3;

/// Correspondences of one view: pattern points on the `z = 0` plane and
/// where they were detected in the image.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarView {
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

/// Board pose of one view as a Rodrigues vector and a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl ViewPose {
    fn to_dvector(self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.rvec.x,
            self.rvec.y,
            self.rvec.z,
            self.tvec.x,
            self.tvec.y,
            self.tvec.z,
        ])
    }

    fn from_slice(values: &[f64]) -> Self {
        ViewPose {
            rvec: Vector3::new(values[0], values[1], values[2]),
            tvec: Vector3::new(values[3], values[4], values[5]),
        }
    }
}

/// Reprojection residuals of one view.
#[derive(Debug, Clone)]
struct PlanarViewFactor {
    object_points: Vec<[f64; 3]>,
    image_points: Vec<[f64; 2]>,
    /// `cx, cy` when the principal point and distortion are held fixed.
    fixed_center: Option<[f64; 2]>,
}

impl PlanarViewFactor {
    fn new(view: &PlanarView, fixed_center: Option<[f64; 2]>) -> Self {
        PlanarViewFactor {
            object_points: view.object_points.iter().map(|p| [p.x, p.y, p.z]).collect(),
            image_points: view.image_points.iter().map(|p| [p.x, p.y]).collect(),
            fixed_center,
        }
    }
}

impl<T: RealField> Factor<T> for PlanarViewFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let (intrinsics, distortion, pose) = match self.fixed_center {
            Some([cx, cy]) => {
                let focal = &params[0];
                (
                    [
                        focal[0].clone(),
                        focal[1].clone(),
                        nalgebra::convert::<f64, T>(cx),
                        nalgebra::convert::<f64, T>(cy),
                    ],
                    [T::zero(), T::zero(), T::zero(), T::zero(), T::zero()],
                    &params[1],
                )
            }
            None => {
                let intr = &params[0];
                let dist = &params[1];
                (
                    [
                        intr[0].clone(),
                        intr[1].clone(),
                        intr[2].clone(),
                        intr[3].clone(),
                    ],
                    [
                        dist[0].clone(),
                        dist[1].clone(),
                        dist[2].clone(),
                        dist[3].clone(),
                        T::zero(),
                    ],
                    &params[2],
                )
            }
        };
        let rvec = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let tvec = [pose[3].clone(), pose[4].clone(), pose[5].clone()];

        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (object, image)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let [u, v] = project_point(&intrinsics, &distortion, &rvec, &tvec, object);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(image[0]);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(image[1]);
        }
        residuals
    }
}

/// Calibrates a [`RadTanModel`] from several views of a planar pattern.
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    model: RadTanModel,
    views: Vec<PlanarView>,
    poses: Vec<ViewPose>,
}

impl PlanarCalibrationCost {
    /// Starts from an undistorted model with the principal point at the image
    /// centre. Call [`Optimizer::linear_estimation`] before optimizing.
    pub fn new(resolution: Resolution, views: Vec<PlanarView>) -> Self {
        let focal = resolution.width.max(resolution.height) as f64;
        let intrinsics = Intrinsics {
            fx: focal,
            fy: focal,
            cx: (resolution.width as f64 - 1.0) / 2.0,
            cy: (resolution.height as f64 - 1.0) / 2.0,
        };
        PlanarCalibrationCost {
            model: RadTanModel::pinhole(intrinsics, resolution),
            views,
            poses: Vec::new(),
        }
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn poses(&self) -> &[ViewPose] {
        &self.poses
    }

    pub fn views(&self) -> &[PlanarView] {
        &self.views
    }

    fn project(&self, pose: &ViewPose, object: &Point3<f64>) -> [f64; 2] {
        let i = &self.model.intrinsics;
        let d = &self.model.distortions;
        project_point(
            &[i.fx, i.fy, i.cx, i.cy],
            d,
            &[pose.rvec.x, pose.rvec.y, pose.rvec.z],
            &[pose.tvec.x, pose.tvec.y, pose.tvec.z],
            &[object.x, object.y, object.z],
        )
    }

    /// Pixel distance of every correspondence of view `index`.
    pub fn point_errors(&self, index: usize) -> Vec<f64> {
        let (Some(view), Some(pose)) = (self.views.get(index), self.poses.get(index)) else {
            return Vec::new();
        };
        view.object_points
            .iter()
            .zip(view.image_points.iter())
            .map(|(object, image)| {
                let [u, v] = self.project(pose, object);
                ((u - image.x).powi(2) + (v - image.y).powi(2)).sqrt()
            })
            .collect()
    }

    /// RMS reprojection error of each view, in pixels.
    pub fn view_errors(&self) -> Vec<f64> {
        (0..self.views.len())
            .map(|i| {
                let errors = self.point_errors(i);
                if errors.is_empty() {
                    return f64::INFINITY;
                }
                (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
            })
            .collect()
    }

    /// RMS reprojection error over every correspondence of every view.
    pub fn rms_error(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..self.views.len() {
            for e in self.point_errors(i) {
                sum += e * e;
                count += 1;
            }
        }
        if count == 0 {
            return f64::INFINITY;
        }
        (sum / count as f64).sqrt()
    }

    fn check_views(&self) -> Result<(), CameraModelError> {
        if self.views.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "At least one view is required".to_string(),
            ));
        }
        for view in &self.views {
            if view.object_points.len() != view.image_points.len() {
                return Err(CameraModelError::InvalidParams(
                    "Number of 2D and 3D points must match".to_string(),
                ));
            }
            if view.object_points.len() < 4 {
                return Err(CameraModelError::InvalidParams(
                    "Each view needs at least 4 points".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Focal lengths from the orthogonality constraints of the view
    /// homographies, with the principal point at `(cx, cy)`.
    ///
    /// With `omega = diag(a, b, 1)`, `a = 1/fx²`, `b = 1/fy²`, every
    /// homography `H' = T⁻¹H` (pixels shifted to the principal point) gives
    /// `h1ᵀ ω h2 = 0` and `h1ᵀ ω h1 = h2ᵀ ω h2`.
    fn estimate_focal(
        homographies: &[Matrix3<f64>],
        cx: f64,
        cy: f64,
    ) -> Result<(f64, f64), CameraModelError> {
        let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
        let mut a = DMatrix::<f64>::zeros(homographies.len() * 2, 2);
        let mut b = DVector::<f64>::zeros(homographies.len() * 2);
        for (k, h) in homographies.iter().enumerate() {
            let hs = shift * h;
            let hs = hs / hs.norm();
            let h1 = hs.column(0).into_owned();
            let h2 = hs.column(1).into_owned();

            a[(2 * k, 0)] = h1.x * h2.x;
            a[(2 * k, 1)] = h1.y * h2.y;
            b[2 * k] = -h1.z * h2.z;

            a[(2 * k + 1, 0)] = h1.x * h1.x - h2.x * h2.x;
            a[(2 * k + 1, 1)] = h1.y * h1.y - h2.y * h2.y;
            b[2 * k + 1] = -(h1.z * h1.z - h2.z * h2.z);
        }

        let solution = a
            .clone()
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| CameraModelError::NumericalError(e.to_string()))?;
        if solution[0] > 0.0 && solution[1] > 0.0 {
            return Ok((1.0 / solution[0].sqrt(), 1.0 / solution[1].sqrt()));
        }

        // Equal focal lengths: a single unknown shared by both columns.
        let column = a.column(0) + a.column(1);
        let denom = column.dot(&column);
        if denom > f64::EPSILON {
            let omega = column.dot(&b) / denom;
            if omega > 0.0 {
                let focal = 1.0 / omega.sqrt();
                return Ok((focal, focal));
            }
        }
        Err(CameraModelError::NumericalError(
            "Views do not constrain the focal length".to_string(),
        ))
    }

    fn optimize_inner(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        let full_model = self.views.len() >= FULL_MODEL_MIN_VIEWS;
        let fixed_center = if full_model {
            None
        } else {
            Some([self.model.intrinsics.cx, self.model.intrinsics.cy])
        };

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        let intr = &self.model.intrinsics;
        if full_model {
            initial_values.insert(
                "intrinsics".to_string(),
                DVector::from_vec(vec![intr.fx, intr.fy, intr.cx, intr.cy]),
            );
            let d = &self.model.distortions;
            initial_values.insert(
                "distortion".to_string(),
                DVector::from_vec(vec![d[0], d[1], d[2], d[3]]),
            );
        } else {
            initial_values.insert(
                "focal".to_string(),
                DVector::from_vec(vec![intr.fx, intr.fy]),
            );
        }

        for (i, (view, pose)) in self.views.iter().zip(self.poses.iter()).enumerate() {
            let pose_key = format!("pose_{}", i);
            initial_values.insert(pose_key.clone(), pose.to_dvector());
            let factor = PlanarViewFactor::new(view, fixed_center);
            let num_residuals = view.image_points.len() * 2;
            if full_model {
                problem.add_residual_block(
                    num_residuals,
                    &["intrinsics", "distortion", pose_key.as_str()],
                    Box::new(factor),
                    None,
                );
            } else {
                problem.add_residual_block(
                    num_residuals,
                    &["focal", pose_key.as_str()],
                    Box::new(factor),
                    None,
                );
            }
        }

        if verbose {
            info!(
                "Starting calibration over {} views (full model: {})",
                self.views.len(),
                full_model
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;

        let mut model = self.model;
        if full_model {
            let intr = result
                .get("intrinsics")
                .ok_or_else(|| CameraModelError::NumericalError("Missing intrinsics".into()))?;
            let dist = result
                .get("distortion")
                .ok_or_else(|| CameraModelError::NumericalError("Missing distortion".into()))?;
            model.intrinsics = Intrinsics {
                fx: intr[0],
                fy: intr[1],
                cx: intr[2],
                cy: intr[3],
            };
            model.distortions = [dist[0], dist[1], dist[2], dist[3], 0.0];
        } else {
            let focal = result
                .get("focal")
                .ok_or_else(|| CameraModelError::NumericalError("Missing focal".into()))?;
            model.intrinsics.fx = focal[0];
            model.intrinsics.fy = focal[1];
        }
        model.validate_params()?;

        let mut poses = Vec::with_capacity(self.poses.len());
        for i in 0..self.poses.len() {
            let values = result.get(&format!("pose_{}", i)).ok_or_else(|| {
                CameraModelError::NumericalError(format!("Missing pose {}", i))
            })?;
            poses.push(ViewPose::from_slice(values.as_slice()));
        }

        self.model = model;
        self.poses = poses;
        if verbose {
            info!("Calibration finished: {:?}, rms {:.4} px", self.model, self.rms_error());
        }
        Ok(())
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Refines intrinsics, distortion and view poses together.
    ///
    /// The model and poses are only replaced when the solver succeeds and the
    /// refined model validates.
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        self.check_views()?;
        if self.poses.len() != self.views.len() {
            self.linear_estimation()?;
        }
        self.optimize_inner(verbose)
    }

    /// Estimates the focal lengths and one pose per view from the view
    /// homographies. Distortion is reset to zero and the principal point is
    /// placed at the image centre.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError>
    where
        Self: Sized,
    {
        self.check_views()?;

        let mut homographies = Vec::with_capacity(self.views.len());
        for view in &self.views {
            let plane: Vec<Point2<f64>> = view
                .object_points
                .iter()
                .map(|p| Point2::new(p.x, p.y))
                .collect();
            let h = find_homography(&plane, &view.image_points).ok_or_else(|| {
                CameraModelError::NumericalError("Degenerate view homography".to_string())
            })?;
            homographies.push(h);
        }

        let resolution = self.model.resolution;
        let cx = (resolution.width as f64 - 1.0) / 2.0;
        let cy = (resolution.height as f64 - 1.0) / 2.0;
        let (fx, fy) = Self::estimate_focal(&homographies, cx, cy)?;
        debug!("Linear focal estimate fx {:.2} fy {:.2}", fx, fy);

        let intrinsics = Intrinsics { fx, fy, cx, cy };
        let k_inv = intrinsics.camera_matrix().try_inverse().ok_or_else(|| {
            CameraModelError::NumericalError("Camera matrix is singular".to_string())
        })?;

        let mut poses = Vec::with_capacity(homographies.len());
        for h in &homographies {
            let (rotation, translation) =
                planar_pose_from_homography(&(k_inv * h)).ok_or_else(|| {
                    CameraModelError::NumericalError(
                        "Could not decompose view homography".to_string(),
                    )
                })?;
            poses.push(ViewPose {
                rvec: vector_from_rotation(&rotation),
                tvec: translation,
            });
        }

        self.model = RadTanModel::pinhole(intrinsics, resolution);
        self.model.validate_params()?;
        self.poses = poses;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.model.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.get_distortion()
    }
}
