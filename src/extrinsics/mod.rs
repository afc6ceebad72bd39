//! Per-frame pose of the reference plane.
//!
//! Once the lens is calibrated, [`ExtrinsicEstimator::solve`] finds the
//! pattern in a still frame, solves its pose robustly and builds the dense
//! [`TransformMap`] for that pose in the same call. A [`Solution`] therefore
//! always carries a pose and the map derived from it.

pub mod ransac;

pub use ransac::{solve_pnp_ransac, RansacOptions, RansacResult};

use crate::camera::Resolution;
use crate::error::{CalibrationError, Result};
use crate::geometry::rotation_from_vector;
use crate::intrinsics::IntrinsicModel;
use crate::motion::{MotionGate, MotionGateConfig};
use crate::optimization::ViewPose;
use crate::pattern::{check_detection, ObjectPointSet, PatternDetector, PatternModel, PatternSpec};
use crate::remap::{TransformMap, UndistortionMapBuilder};

use image::GrayImage;
use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2, Point3, Vector3};

/// Pose of the reference plane in the camera frame, together with the
/// correspondences it was solved from.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    /// Rodrigues rotation vector.
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
    pub image_points: Vec<Point2<f64>>,
    pub object_points: Vec<Point3<f64>>,
}

impl Pose {
    /// A pose without correspondences.
    pub fn new(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Pose {
            rvec,
            tvec,
            image_points: Vec::new(),
            object_points: Vec::new(),
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        rotation_from_vector(&self.rvec)
    }

    pub fn view_pose(&self) -> ViewPose {
        ViewPose {
            rvec: self.rvec,
            tvec: self.tvec,
        }
    }
}

/// A solved pose and the map built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub pose: Pose,
    pub map: TransformMap,
    /// Indices of the correspondences that agreed with the pose.
    pub inliers: Vec<usize>,
    /// RMS pixel error over the inliers.
    pub reprojection_error: f64,
}

/// Result of one [`ExtrinsicEstimator::solve`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    /// The frame differs too much from the previous one (or there was no
    /// previous one); nothing was attempted.
    Unsettled { diff: Option<f64> },
    /// The pattern is not in the frame.
    NotFound,
    Solved(Box<Solution>),
}

#[derive(Debug, Clone, Default)]
pub struct ExtrinsicConfig {
    /// Only `diff_threshold` is used; there is no timing gate here.
    pub gate: MotionGateConfig,
    pub ransac: RansacOptions,
}

#[derive(Debug, Clone)]
pub struct ExtrinsicEstimator {
    spec: PatternSpec,
    gate: MotionGate,
    ransac: RansacOptions,
    builder: UndistortionMapBuilder,
}

impl ExtrinsicEstimator {
    pub fn new(pattern: &PatternModel, config: ExtrinsicConfig) -> Self {
        ExtrinsicEstimator {
            spec: pattern.spec().clone(),
            gate: MotionGate::new(config.gate),
            ransac: config.ransac,
            builder: UndistortionMapBuilder,
        }
    }

    pub fn ransac_options(&self) -> &RansacOptions {
        &self.ransac
    }

    /// Forgets the previous frame.
    pub fn reset(&mut self) {
        self.gate.reset();
    }

    /// Compares the next frame against `frame` instead of priming on it.
    pub fn prime_gate(&mut self, frame: &GrayImage) {
        self.gate.prime(frame);
    }

    /// Switches to another pattern and forgets the previous frame.
    pub fn set_pattern(&mut self, pattern: &PatternModel) {
        self.spec = pattern.spec().clone();
        self.gate.reset();
    }

    /// Solves the pose of the pattern in `frame` against `object_points`.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::ResolutionMismatch`] if the frame size differs
    ///   from the calibrated resolution. The frame is not used at all.
    /// * [`CalibrationError::Config`] if `object_points` does not have one
    ///   point per pattern node.
    /// * [`CalibrationError::Solve`] if no consensus pose exists.
    pub fn solve(
        &mut self,
        frame: &GrayImage,
        object_points: &ObjectPointSet,
        intrinsics: &IntrinsicModel,
        detector: &dyn PatternDetector,
    ) -> Result<SolveOutcome> {
        let resolution = Resolution::new(frame.width(), frame.height());
        if resolution != intrinsics.resolution() {
            return Err(CalibrationError::ResolutionMismatch {
                expected: intrinsics.resolution(),
                found: resolution,
            });
        }
        if object_points.len() != self.spec.node_count() {
            return Err(CalibrationError::Config(format!(
                "{} object points for a pattern of {} nodes",
                object_points.len(),
                self.spec.node_count()
            )));
        }

        let diff = self.gate.difference(frame);
        match diff {
            Some(d) if d < self.gate.config().diff_threshold => {}
            _ => {
                debug!("Extrinsic frame unsettled, diff {:?}", diff);
                return Ok(SolveOutcome::Unsettled { diff });
            }
        }

        let image_points = match detector.detect(frame, &self.spec) {
            Some(points) if check_detection(&self.spec, &points) => points,
            _ => {
                debug!("Pattern not found in extrinsic frame");
                return Ok(SolveOutcome::NotFound);
            }
        };

        let Some(result) = solve_pnp_ransac(
            &intrinsics.lens,
            &object_points.points,
            &image_points,
            &self.ransac,
        ) else {
            warn!("No consensus pose for {} correspondences", image_points.len());
            return Err(CalibrationError::Solve(format!(
                "no pose agrees with {:.0}% of {} correspondences",
                self.ransac.min_inlier_ratio * 100.0,
                image_points.len()
            )));
        };

        let pose = Pose {
            rvec: result.model.rvec,
            tvec: result.model.tvec,
            image_points,
            object_points: object_points.points.clone(),
        };
        info!(
            "Solved pose rvec [{:.4}, {:.4}, {:.4}] tvec [{:.2}, {:.2}, {:.2}], \
             {} inliers, rms {:.4} px",
            pose.rvec.x,
            pose.rvec.y,
            pose.rvec.z,
            pose.tvec.x,
            pose.tvec.y,
            pose.tvec.z,
            result.inliers.len(),
            result.inlier_rms
        );
        let map = self.builder.rebuild(resolution, &pose, &intrinsics.lens);
        Ok(SolveOutcome::Solved(Box::new(Solution {
            pose,
            map,
            inliers: result.inliers,
            reprojection_error: result.inlier_rms,
        })))
    }
}
