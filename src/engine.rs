//! The calibration session.
//!
//! [`CalibrationEngine`] drives the two phases frame by frame. Intrinsic
//! frames pass the motion gate into the [`IntrinsicEstimator`] until it
//! converges; after that every extrinsic frame is handed to the
//! [`ExtrinsicEstimator`] until a pose is solved. Each milestone that must be
//! durable is saved before the call returns.
//!
//! The session resolution is the size of the first frame seen (or of the
//! loaded calibration). Frames of any other size are rejected with
//! [`CalibrationError::ResolutionMismatch`] and change nothing; call
//! [`CalibrationEngine::reset`] to start over at a new size.

use crate::camera::Resolution;
use crate::error::{CalibrationError, Result};
use crate::extrinsics::{ExtrinsicConfig, ExtrinsicEstimator, Pose, RansacOptions, SolveOutcome};
use crate::intrinsics::{
    EstimatorState, IntrinsicConfig, IntrinsicEstimator, IntrinsicModel, SubmitOutcome,
};
use crate::motion::{MotionGate, MotionGateConfig};
use crate::pattern::{
    BlobGridDetector, ObjectPointSet, PatternDetector, PatternModel, PatternSpec,
    DEFAULT_MARGIN_FACTOR,
};
use crate::persistence::{self, CalibrationPaths};
use crate::remap::{lens_undistortion_map, remap, TransformMap};
use crate::transform::CoordinateTransformer;
use crate::util::{self, ReprojectionReport, UtilError};

use image::GrayImage;
use log::{debug, info, warn};
use nalgebra::Point2;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CollectingIntrinsics,
    IntrinsicsReady,
    Solved,
}

/// What a frame achieved, for the surrounding application to react to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Milestone {
    /// The frame was gated out: too much motion, too soon after the last
    /// sample, or the first frame after a (re)start. `diff` is the frame
    /// difference when there was one to compute.
    Waiting { diff: Option<f64> },
    PatternNotFound,
    /// A new intrinsic sample was taken.
    PatternFound {
        samples: usize,
        reprojection_error: f64,
    },
    /// Intrinsics converged and were saved.
    IntrinsicsReady,
    /// A pose was solved, its map built and both saved.
    ExtrinsicsSolved,
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub gate: MotionGateConfig,
    pub intrinsics: IntrinsicConfig,
    pub ransac: RansacOptions,
    /// Shrink of the extrinsic object grid, see
    /// [`PatternModel::build_object_points`].
    pub margin_factor: Option<f64>,
}

pub struct CalibrationEngine {
    pattern: PatternModel,
    paths: CalibrationPaths,
    detector: Box<dyn PatternDetector>,
    gate: MotionGate,
    intrinsics: IntrinsicEstimator,
    extrinsics: ExtrinsicEstimator,
    margin_factor: f64,
    object_points: ObjectPointSet,
    pose: Option<Pose>,
    map: Option<TransformMap>,
    lens_map: Option<TransformMap>,
    resolution: Option<Resolution>,
    phase: Phase,
}

impl CalibrationEngine {
    /// An engine using the built-in [`BlobGridDetector`].
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Config`] for an invalid configuration or a pattern
    /// type the built-in detector cannot find.
    pub fn new(
        pattern: PatternModel,
        paths: CalibrationPaths,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_detector(pattern, paths, config, Box::new(BlobGridDetector::new()))
    }

    pub fn with_detector(
        pattern: PatternModel,
        paths: CalibrationPaths,
        config: EngineConfig,
        detector: Box<dyn PatternDetector>,
    ) -> Result<Self> {
        let pattern_type = pattern.spec().pattern_type;
        if !detector.supports(pattern_type) {
            return Err(CalibrationError::Config(format!(
                "detector does not support {:?} patterns",
                pattern_type
            )));
        }
        let margin_factor = config.margin_factor.unwrap_or(DEFAULT_MARGIN_FACTOR);
        let object_points = pattern.build_object_points(margin_factor)?;
        let intrinsics = IntrinsicEstimator::new(&pattern, config.intrinsics)?;
        let extrinsics = ExtrinsicEstimator::new(
            &pattern,
            ExtrinsicConfig {
                gate: config.gate,
                ransac: config.ransac,
            },
        );
        Ok(CalibrationEngine {
            pattern,
            paths,
            detector,
            gate: MotionGate::new(config.gate),
            intrinsics,
            extrinsics,
            margin_factor,
            object_points,
            pose: None,
            map: None,
            lens_map: None,
            resolution: None,
            phase: Phase::Idle,
        })
    }

    /// Reads the pattern from a settings document (defaults when it does not
    /// exist) and keeps the calibration documents in `output_dir`.
    pub fn from_settings<P: AsRef<Path>, Q: AsRef<Path>>(
        settings: P,
        output_dir: Q,
        config: EngineConfig,
    ) -> Result<Self> {
        let spec = PatternSpec::load_settings_or_default(settings)?;
        let pattern = PatternModel::configure(spec)?;
        Self::new(pattern, CalibrationPaths::from_dir(output_dir), config)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pattern(&self) -> &PatternModel {
        &self.pattern
    }

    pub fn paths(&self) -> &CalibrationPaths {
        &self.paths
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn intrinsic_model(&self) -> Option<&IntrinsicModel> {
        self.intrinsics.model()
    }

    pub fn intrinsic_estimator(&self) -> &IntrinsicEstimator {
        &self.intrinsics
    }

    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn map(&self) -> Option<&TransformMap> {
        self.map.as_ref()
    }

    pub fn object_points(&self) -> &ObjectPointSet {
        &self.object_points
    }

    /// Starts (or restarts) intrinsic collection. Any loaded or solved
    /// calibration is dropped.
    pub fn start_intrinsics(&mut self) {
        self.intrinsics.start();
        self.gate.reset();
        self.extrinsics.reset();
        self.pose = None;
        self.map = None;
        self.lens_map = None;
        self.resolution = None;
        self.phase = Phase::CollectingIntrinsics;
    }

    /// Back to `Idle` with nothing calibrated.
    pub fn reset(&mut self) {
        self.start_intrinsics();
        self.phase = Phase::Idle;
        info!("Calibration reset");
    }

    /// Feeds one intrinsic frame taken at `now` seconds.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidState`] outside intrinsic collection.
    /// * [`CalibrationError::ResolutionMismatch`] for a frame of another size.
    /// * [`CalibrationError::Fit`] when the refit failed; the sample is
    ///   dropped and the previous model kept.
    /// * [`CalibrationError::Persistence`] when the converged model could not
    ///   be saved. Collection is not complete then; the save is retried on
    ///   the next call.
    pub fn update_intrinsics(&mut self, frame: &GrayImage, now: f64) -> Result<Milestone> {
        if self.phase != Phase::CollectingIntrinsics {
            return Err(CalibrationError::InvalidState(format!(
                "cannot collect intrinsics in phase {:?}",
                self.phase
            )));
        }
        if self.intrinsics.state() == EstimatorState::Converged {
            return self.commit_intrinsics();
        }
        let resolution = self.check_resolution(frame)?;
        self.resolution = Some(resolution);

        if !self.gate.accept(frame, now) {
            return Ok(Milestone::Waiting {
                diff: self.gate.last_difference(),
            });
        }

        match self.intrinsics.submit(frame, now, self.detector.as_ref())? {
            SubmitOutcome::NoDetection => Ok(Milestone::PatternNotFound),
            SubmitOutcome::Progress {
                samples,
                reprojection_error,
            } => {
                self.gate.record_sample(now);
                self.refresh_lens_map();
                Ok(Milestone::PatternFound {
                    samples,
                    reprojection_error,
                })
            }
            SubmitOutcome::IntrinsicsReady => {
                self.gate.record_sample(now);
                self.refresh_lens_map();
                self.commit_intrinsics()
            }
        }
    }

    /// Saves the converged model and moves on to the extrinsic phase.
    fn commit_intrinsics(&mut self) -> Result<Milestone> {
        let model = *self.intrinsics.model().ok_or_else(|| {
            CalibrationError::InvalidState("converged without a model".to_string())
        })?;
        let saved =
            persistence::save_intrinsics(&self.paths.intrinsics, &model, self.pattern.spec());
        if let Err(err) = saved {
            warn!("Intrinsics converged but could not be saved: {}", err);
            return Err(CalibrationError::Persistence(err.to_string()));
        }
        if let Some(previous) = self.gate.previous_frame() {
            self.extrinsics.prime_gate(previous);
        }
        self.phase = Phase::IntrinsicsReady;
        info!(
            "Intrinsics ready: {:?}, reprojection error {:.4} px",
            model.intrinsics(),
            model.reprojection_error
        );
        Ok(Milestone::IntrinsicsReady)
    }

    /// Feeds one extrinsic frame.
    ///
    /// The pose and map only change when a new pose is solved and saved.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidState`] before intrinsics are ready.
    /// * [`CalibrationError::ResolutionMismatch`] for a frame of another size.
    /// * [`CalibrationError::Solve`] when no consensus pose was found.
    /// * [`CalibrationError::Persistence`] when the solved pose could not be
    ///   saved; the pose is discarded.
    pub fn update_extrinsics(&mut self, frame: &GrayImage) -> Result<Milestone> {
        if !matches!(self.phase, Phase::IntrinsicsReady | Phase::Solved) {
            return Err(CalibrationError::InvalidState(format!(
                "cannot solve extrinsics in phase {:?}",
                self.phase
            )));
        }
        self.check_resolution(frame)?;
        let model = *self
            .intrinsics
            .model()
            .ok_or_else(|| CalibrationError::InvalidState("no intrinsic model".to_string()))?;

        let outcome = self.extrinsics.solve(
            frame,
            &self.object_points,
            &model,
            self.detector.as_ref(),
        )?;
        let solution = match outcome {
            SolveOutcome::Unsettled { diff } => return Ok(Milestone::Waiting { diff }),
            SolveOutcome::NotFound => return Ok(Milestone::PatternNotFound),
            SolveOutcome::Solved(solution) => solution,
        };

        let saved =
            persistence::save_extrinsics(&self.paths.extrinsics, &solution.pose, &solution.map);
        if let Err(err) = saved {
            warn!("Pose solved but could not be saved: {}", err);
            return Err(CalibrationError::Persistence(err.to_string()));
        }
        self.resolution = Some(solution.map.resolution());
        self.pose = Some(solution.pose);
        self.map = Some(solution.map);
        self.phase = Phase::Solved;
        info!("Extrinsics solved and saved");
        Ok(Milestone::ExtrinsicsSolved)
    }

    /// Restores intrinsics from the intrinsics document, along with the
    /// pattern they were calibrated with. Returns `false` (leaving the engine
    /// untouched) when it is missing or invalid, or its pattern cannot be
    /// detected.
    pub fn load_intrinsics(&mut self) -> bool {
        let document = match persistence::load_intrinsics(&self.paths.intrinsics) {
            Ok(document) => document,
            Err(err) => {
                warn!("Could not load intrinsics: {}", err);
                return false;
            }
        };
        let resolution = document.model.resolution();
        if let Some(expected) = self.resolution {
            if expected != resolution {
                warn!(
                    "Intrinsics resolution {:?} does not match session resolution {:?}",
                    resolution, expected
                );
                return false;
            }
        }
        if document.pattern != *self.pattern.spec() {
            if let Err(err) = self.adopt_pattern(document.pattern) {
                warn!("Cannot use pattern {:?}: {}", document.pattern, err);
                return false;
            }
        }

        self.intrinsics.restore(document.model);
        self.extrinsics.reset();
        self.pose = None;
        self.map = None;
        self.resolution = Some(resolution);
        self.refresh_lens_map();
        self.phase = Phase::IntrinsicsReady;
        true
    }

    /// Restores the pose and map from the extrinsics document, skipping
    /// detection. Needs intrinsics first. Returns `false` (leaving the engine
    /// untouched) when the document is missing, invalid, or its map does not
    /// match the intrinsics resolution.
    pub fn load_extrinsics(&mut self) -> bool {
        let Some(model) = self.intrinsics.model().copied() else {
            warn!("Load intrinsics before extrinsics");
            return false;
        };
        if !matches!(self.phase, Phase::IntrinsicsReady | Phase::Solved) {
            warn!("Cannot load extrinsics in phase {:?}", self.phase);
            return false;
        }
        let (pose, map) = match persistence::load_extrinsics(&self.paths.extrinsics) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!("Could not load extrinsics: {}", err);
                return false;
            }
        };
        if map.resolution() != model.resolution() {
            warn!(
                "Extrinsic map {:?} does not match intrinsics resolution {:?}",
                map.resolution(),
                model.resolution()
            );
            return false;
        }
        self.pose = Some(pose);
        self.map = Some(map);
        self.phase = Phase::Solved;
        true
    }

    /// Drops the pose and map so a new pose can be solved.
    pub fn reset_extrinsics(&mut self) {
        self.pose = None;
        self.map = None;
        self.extrinsics.reset();
        if self.phase == Phase::Solved {
            self.phase = Phase::IntrinsicsReady;
        }
        debug!("Extrinsics reset");
    }

    /// Changes the shrink of the extrinsic object grid. Takes effect on the
    /// next solved pose.
    pub fn set_margin_factor(&mut self, margin_factor: f64) -> Result<()> {
        self.object_points = self.pattern.build_object_points(margin_factor)?;
        self.margin_factor = margin_factor;
        Ok(())
    }

    pub fn margin_factor(&self) -> f64 {
        self.margin_factor
    }

    fn transformer(&self) -> Result<CoordinateTransformer> {
        let pose = self.pose.as_ref().ok_or(CalibrationError::NoPose)?;
        let model = self.intrinsics.model().ok_or(CalibrationError::NoPose)?;
        Ok(CoordinateTransformer::new(pose, &model.lens))
    }

    /// Plane point seen at `pixel` under the current pose.
    pub fn image_to_object(&self, pixel: &Point2<f64>) -> Result<Point2<f64>> {
        self.transformer()?.image_to_object(pixel)
    }

    /// Pixel at which plane point `point` is seen under the current pose.
    pub fn object_to_image(&self, point: &Point2<f64>) -> Result<Point2<f64>> {
        Ok(self.transformer()?.object_to_image(point))
    }

    /// Top-down view of the reference plane through the current map.
    pub fn rectify(&self, frame: &GrayImage) -> Result<GrayImage> {
        let map = self.map.as_ref().ok_or(CalibrationError::NoPose)?;
        self.check_resolution(frame)?;
        Ok(remap(frame, map))
    }

    /// `frame` with lens distortion removed, available once a model exists.
    pub fn undistort(&self, frame: &GrayImage) -> Result<GrayImage> {
        let map = self.lens_map.as_ref().ok_or_else(|| {
            CalibrationError::InvalidState("no intrinsic model yet".to_string())
        })?;
        self.check_resolution(frame)?;
        Ok(remap(frame, map))
    }

    /// How well the current pose maps its own detections back onto the plane.
    pub fn reprojection_report(&self) -> Result<ReprojectionReport> {
        let pose = self.pose.as_ref().ok_or(CalibrationError::NoPose)?;
        let model = self
            .intrinsics
            .model()
            .ok_or_else(|| CalibrationError::InvalidState("no intrinsic model".to_string()))?;
        util::reprojection_report(pose, model, &pose.object_points).map_err(|e| match e {
            UtilError::Calibration(err) => err,
            other => CalibrationError::InvalidState(other.to_string()),
        })
    }

    /// Switches the session to `spec`, rebuilding everything derived from it.
    fn adopt_pattern(&mut self, spec: PatternSpec) -> Result<()> {
        if !self.detector.supports(spec.pattern_type) {
            return Err(CalibrationError::Config(format!(
                "detector does not support {:?} patterns",
                spec.pattern_type
            )));
        }
        let pattern = PatternModel::configure(spec)?;
        let object_points = pattern.build_object_points(self.margin_factor)?;
        let intrinsics = IntrinsicEstimator::new(&pattern, *self.intrinsics.config())?;
        info!(
            "Adopting pattern {:?} from the intrinsics document",
            pattern.spec()
        );
        self.extrinsics.set_pattern(&pattern);
        self.intrinsics = intrinsics;
        self.object_points = object_points;
        self.pattern = pattern;
        Ok(())
    }

    fn refresh_lens_map(&mut self) {
        self.lens_map = self
            .intrinsics
            .model()
            .map(|m| lens_undistortion_map(&m.lens, m.resolution()));
    }

    fn check_resolution(&self, frame: &GrayImage) -> Result<Resolution> {
        let found = Resolution::new(frame.width(), frame.height());
        match self.resolution {
            Some(expected) if expected != found => {
                Err(CalibrationError::ResolutionMismatch { expected, found })
            }
            _ => Ok(found),
        }
    }
}
