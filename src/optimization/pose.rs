//! Single-view pose estimation against a fixed lens model.

use crate::camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
use crate::geometry::{find_homography, planar_pose_from_homography, vector_from_rotation};
use crate::optimization::{project_point, Optimizer, ViewPose};

use log::info;
use nalgebra::{DVector, Point2, Point3, RealField};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Pose of a planar pattern from its correspondences.
///
/// Pixels are undistorted into normalised coordinates, the plane-to-image
/// homography is fitted and decomposed. Needs at least four non-collinear
/// points on the `z = 0` plane.
pub fn planar_pose_from_points(
    model: &RadTanModel,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> Option<ViewPose> {
    if object_points.len() != image_points.len() || object_points.len() < 4 {
        return None;
    }
    let plane: Vec<Point2<f64>> = object_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let normalized = image_points
        .iter()
        .map(|p| {
            model
                .undistort_pixel(&p.coords)
                .ok()
                .map(Point2::from)
        })
        .collect::<Option<Vec<_>>>()?;

    let h = find_homography(&plane, &normalized)?;
    let (rotation, translation) = planar_pose_from_homography(&h)?;
    Some(ViewPose {
        rvec: vector_from_rotation(&rotation),
        tvec: translation,
    })
}

#[derive(Debug, Clone)]
struct PoseFactor {
    object_points: Vec<[f64; 3]>,
    image_points: Vec<[f64; 2]>,
    intrinsics: [f64; 4],
    distortion: [f64; 5],
}

impl<T: RealField> Factor<T> for PoseFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let rvec = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let tvec = [pose[3].clone(), pose[4].clone(), pose[5].clone()];
        let intrinsics = self.intrinsics.map(nalgebra::convert::<f64, T>);
        let distortion = self.distortion.map(nalgebra::convert::<f64, T>);

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

/// Refines the 6-DoF pose of one view with the lens model held fixed.
#[derive(Clone)]
pub struct PoseRefinementCost {
    model: RadTanModel,
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
    pose: Option<ViewPose>,
}

impl PoseRefinementCost {
    pub fn new(
        model: RadTanModel,
        object_points: Vec<Point3<f64>>,
        image_points: Vec<Point2<f64>>,
    ) -> Self {
        PoseRefinementCost {
            model,
            object_points,
            image_points,
            pose: None,
        }
    }

    /// Starts the refinement from `pose` instead of the linear estimate.
    pub fn with_initial_pose(mut self, pose: ViewPose) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn pose(&self) -> Option<ViewPose> {
        self.pose
    }

    /// Pixel distance of every correspondence under the current pose.
    pub fn point_errors(&self) -> Vec<f64> {
        let Some(pose) = self.pose else {
            return Vec::new();
        };
        let i = &self.model.intrinsics;
        self.object_points
            .iter()
            .zip(self.image_points.iter())
            .map(|(object, image)| {
                let [u, v] = project_point(
                    &[i.fx, i.fy, i.cx, i.cy],
                    &self.model.distortions,
                    &[pose.rvec.x, pose.rvec.y, pose.rvec.z],
                    &[pose.tvec.x, pose.tvec.y, pose.tvec.z],
                    &[object.x, object.y, object.z],
                );
                ((u - image.x).powi(2) + (v - image.y).powi(2)).sqrt()
            })
            .collect()
    }
}

impl Optimizer for PoseRefinementCost {
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        if self.object_points.len() != self.image_points.len() {
            return Err(CameraModelError::InvalidParams(
                "Number of 2D and 3D points must match".to_string(),
            ));
        }
        if self.object_points.len() < 4 {
            return Err(CameraModelError::InvalidParams(
                "Pose refinement needs at least 4 points".to_string(),
            ));
        }
        if self.pose.is_none() {
            self.linear_estimation()?;
        }
        let initial = self
            .pose
            .ok_or_else(|| CameraModelError::NumericalError("No initial pose".to_string()))?;

        let i = &self.model.intrinsics;
        let factor = PoseFactor {
            object_points: self.object_points.iter().map(|p| [p.x, p.y, p.z]).collect(),
            image_points: self.image_points.iter().map(|p| [p.x, p.y]).collect(),
            intrinsics: [i.fx, i.fy, i.cx, i.cy],
            distortion: self.model.distortions,
        };

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(
            self.image_points.len() * 2,
            &["pose"],
            Box::new(factor),
            None,
        );
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "pose".to_string(),
            DVector::from_vec(vec![
                initial.rvec.x,
                initial.rvec.y,
                initial.rvec.z,
                initial.tvec.x,
                initial.tvec.y,
                initial.tvec.z,
            ]),
        );

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;
        let values = result
            .get("pose")
            .ok_or_else(|| CameraModelError::NumericalError("Missing pose".to_string()))?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::NumericalError(
                "Refined pose is not finite".to_string(),
            ));
        }

        let refined = ViewPose {
            rvec: nalgebra::Vector3::new(values[0], values[1], values[2]),
            tvec: nalgebra::Vector3::new(values[3], values[4], values[5]),
        };
        if verbose {
            info!("Pose refined: rvec {:?} tvec {:?}", refined.rvec, refined.tvec);
        }
        self.pose = Some(refined);
        Ok(())
    }

    fn linear_estimation(&mut self) -> Result<(), CameraModelError>
    where
        Self: Sized,
    {
        let pose = planar_pose_from_points(&self.model, &self.object_points, &self.image_points)
            .ok_or_else(|| {
                CameraModelError::NumericalError("Degenerate pose homography".to_string())
            })?;
        self.pose = Some(pose);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation_from_vector;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 600.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution::new(640, 480),
            distortions: [-0.1, 0.02, 0.0, 0.0, 0.0],
        }
    }

    fn correspondences(pose: &ViewPose) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
        let r = rotation_from_vector(&pose.rvec);
        let object: Vec<Point3<f64>> = (0..5)
            .flat_map(|i| (0..7).map(move |j| Point3::new(j as f64 * 30.0, i as f64 * 30.0, 0.0)))
            .collect();
        let image = object
            .iter()
            .map(|p| {
                let px = model().project(&(r * p.coords + pose.tvec)).unwrap();
                Point2::new(px.x, px.y)
            })
            .collect();
        (object, image)
    }

    #[test]
    fn test_planar_pose_from_points() {
        let truth = ViewPose {
            rvec: Vector3::new(0.2, -0.15, 0.05),
            tvec: Vector3::new(-90.0, -60.0, 700.0),
        };
        let (object, image) = correspondences(&truth);
        let pose = planar_pose_from_points(&model(), &object, &image).unwrap();
        assert_relative_eq!(pose.rvec, truth.rvec, epsilon = 1e-6);
        assert_relative_eq!(pose.tvec, truth.tvec, epsilon = 1e-3);
    }

    #[test]
    fn test_refinement_from_perturbed_pose() {
        let truth = ViewPose {
            rvec: Vector3::new(-0.1, 0.3, 0.0),
            tvec: Vector3::new(-100.0, -50.0, 650.0),
        };
        let (object, image) = correspondences(&truth);
        let start = ViewPose {
            rvec: truth.rvec + Vector3::new(0.02, -0.02, 0.01),
            tvec: truth.tvec + Vector3::new(5.0, -4.0, 20.0),
        };
        let mut cost = PoseRefinementCost::new(model(), object, image).with_initial_pose(start);
        cost.optimize(false).unwrap();

        let pose = cost.pose().unwrap();
        assert_relative_eq!(pose.rvec, truth.rvec, epsilon = 1e-4);
        assert_relative_eq!(pose.tvec, truth.tvec, epsilon = 0.05);
        assert!(cost.point_errors().iter().all(|e| *e < 1e-2));
    }

    #[test]
    fn test_too_few_points() {
        let mut cost = PoseRefinementCost::new(
            model(),
            vec![Point3::origin(); 3],
            vec![Point2::origin(); 3],
        );
        assert!(matches!(
            cost.optimize(false),
            Err(CameraModelError::InvalidParams(_))
        ));
    }
}
