//! Intrinsic calibration from a stream of pattern views.
//!
//! The [`IntrinsicEstimator`] accumulates accepted samples and re-solves the
//! lens model over all of them after every new sample. Once more than
//! [`IntrinsicConfig::clean_after`] samples are held, samples whose own
//! reprojection error is well above the rest are discarded and the model is
//! solved again. Collection converges after
//! [`IntrinsicConfig::target_samples`] accepted samples.

use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::error::{CalibrationError, Result};
use crate::optimization::{Optimizer, PlanarCalibrationCost, PlanarView};
use crate::pattern::{check_detection, PatternDetector, PatternModel, PatternSpec};

use image::GrayImage;
use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// Outlier rejection settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleaningConfig {
    /// Samples above `mean + stddev_factor · stddev` of the per-sample error
    /// are discarded.
    pub stddev_factor: f64,
    /// Samples at or below this error (pixels) are always kept.
    pub min_error: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        CleaningConfig {
            stddev_factor: 1.0,
            min_error: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntrinsicConfig {
    /// Accepted samples needed to converge.
    pub target_samples: usize,
    /// Cleaning runs once more than this many samples are held.
    pub clean_after: usize,
    pub cleaning: CleaningConfig,
    /// Cleaning never leaves fewer samples than this.
    pub min_samples_kept: usize,
}

impl Default for IntrinsicConfig {
    fn default() -> Self {
        IntrinsicConfig {
            target_samples: 8,
            clean_after: 6,
            cleaning: CleaningConfig::default(),
            min_samples_kept: 3,
        }
    }
}

/// One accepted calibration view.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Detected pattern nodes, row-major.
    pub image_points: Vec<Point2<f64>>,
    /// Time the sample was accepted, in seconds.
    pub timestamp: f64,
}

/// The fitted lens model and how well it explains the retained samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicModel {
    pub lens: RadTanModel,
    /// Samples the model was fitted on.
    pub sample_count: usize,
    /// RMS reprojection error over every retained correspondence, in pixels.
    pub reprojection_error: f64,
}

impl IntrinsicModel {
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.lens.camera_matrix()
    }

    /// `[k1, k2, p1, p2, k3]`.
    pub fn distortion_coefficients(&self) -> [f64; 5] {
        self.lens.distortions
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.lens.intrinsics
    }

    pub fn resolution(&self) -> Resolution {
        self.lens.resolution
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Idle,
    Collecting,
    Converged,
}

/// Result of submitting a frame or a detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubmitOutcome {
    /// The pattern was not found; nothing changed.
    NoDetection,
    /// The sample was added and the model refitted.
    Progress {
        samples: usize,
        reprojection_error: f64,
    },
    /// The target sample count was reached.
    IntrinsicsReady,
}

#[derive(Debug, Clone)]
struct Fit {
    model: IntrinsicModel,
    view_errors: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct IntrinsicEstimator {
    config: IntrinsicConfig,
    spec: PatternSpec,
    object_points: Vec<Point3<f64>>,
    state: EstimatorState,
    samples: Vec<Sample>,
    sample_errors: Vec<f64>,
    accepted: usize,
    model: Option<IntrinsicModel>,
    resolution: Option<Resolution>,
}

impl IntrinsicEstimator {
    /// Calibrates against the true board geometry of `pattern`.
    pub fn new(pattern: &PatternModel, config: IntrinsicConfig) -> Result<Self> {
        if config.target_samples == 0 || config.min_samples_kept == 0 {
            return Err(CalibrationError::Config(
                "target_samples and min_samples_kept must be positive".to_string(),
            ));
        }
        let object_points = pattern.build_object_points(1.0)?.points;
        Ok(IntrinsicEstimator {
            config,
            spec: pattern.spec().clone(),
            object_points,
            state: EstimatorState::Idle,
            samples: Vec::new(),
            sample_errors: Vec::new(),
            accepted: 0,
            model: None,
            resolution: None,
        })
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    pub fn config(&self) -> &IntrinsicConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&IntrinsicModel> {
        self.model.as_ref()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// RMS error of each retained sample under the current model.
    pub fn sample_errors(&self) -> &[f64] {
        &self.sample_errors
    }

    /// Samples accepted since collection started, including cleaned ones.
    pub fn accepted_count(&self) -> usize {
        self.accepted
    }

    /// Begins (or restarts) collection, dropping samples and model.
    pub fn start(&mut self) {
        self.samples.clear();
        self.sample_errors.clear();
        self.accepted = 0;
        self.model = None;
        self.resolution = None;
        self.state = EstimatorState::Collecting;
        info!("Collecting intrinsic samples");
    }

    /// Installs a previously fitted model and marks collection converged.
    pub fn restore(&mut self, model: IntrinsicModel) {
        self.samples.clear();
        self.sample_errors.clear();
        self.accepted = model.sample_count;
        self.resolution = Some(model.resolution());
        self.model = Some(model);
        self.state = EstimatorState::Converged;
    }

    /// Detects the pattern in `frame` and, if found, adds it as a sample.
    ///
    /// The frame is only borrowed for the duration of the call.
    pub fn submit(
        &mut self,
        frame: &GrayImage,
        timestamp: f64,
        detector: &dyn PatternDetector,
    ) -> Result<SubmitOutcome> {
        self.ensure_collecting()?;
        let resolution = Resolution::new(frame.width(), frame.height());
        self.check_resolution(resolution)?;

        let Some(points) = detector.detect(frame, &self.spec) else {
            debug!("Pattern not found in intrinsic frame");
            return Ok(SubmitOutcome::NoDetection);
        };
        if !check_detection(&self.spec, &points) {
            return Ok(SubmitOutcome::NoDetection);
        }
        self.add_detection(points, timestamp, resolution)
    }

    /// Adds an already detected view and refits.
    ///
    /// On a failed fit the sample is dropped again, the previous model is
    /// kept and [`CalibrationError::Fit`] is returned.
    pub fn add_detection(
        &mut self,
        image_points: Vec<Point2<f64>>,
        timestamp: f64,
        resolution: Resolution,
    ) -> Result<SubmitOutcome> {
        self.ensure_collecting()?;
        self.check_resolution(resolution)?;
        if !check_detection(&self.spec, &image_points) {
            return Ok(SubmitOutcome::NoDetection);
        }

        self.samples.push(Sample {
            image_points,
            timestamp,
        });
        let fit = match self.fit(&self.samples, resolution) {
            Ok(fit) => fit,
            Err(err) => {
                self.samples.pop();
                warn!("Re-calibration failed, keeping previous model: {}", err);
                return Err(err);
            }
        };

        self.resolution = Some(resolution);
        self.accepted += 1;
        info!(
            "Re-calibrated with {} samples, reprojection error {:.4} px",
            self.samples.len(),
            fit.model.reprojection_error
        );
        self.model = Some(fit.model);
        self.sample_errors = fit.view_errors;

        if self.samples.len() > self.config.clean_after {
            self.clean(resolution);
        }

        if self.accepted >= self.config.target_samples {
            self.state = EstimatorState::Converged;
            info!("Intrinsics converged after {} samples", self.accepted);
            return Ok(SubmitOutcome::IntrinsicsReady);
        }
        let error = self.model.as_ref().map_or(f64::INFINITY, |m| m.reprojection_error);
        Ok(SubmitOutcome::Progress {
            samples: self.samples.len(),
            reprojection_error: error,
        })
    }

    fn ensure_collecting(&self) -> Result<()> {
        if self.state != EstimatorState::Collecting {
            return Err(CalibrationError::InvalidState(format!(
                "intrinsic estimator is {:?}, not collecting",
                self.state
            )));
        }
        Ok(())
    }

    fn check_resolution(&self, found: Resolution) -> Result<()> {
        match self.resolution {
            Some(expected) if expected != found => {
                Err(CalibrationError::ResolutionMismatch { expected, found })
            }
            _ => Ok(()),
        }
    }

    /// Full re-solve over `samples`.
    fn fit(&self, samples: &[Sample], resolution: Resolution) -> Result<Fit> {
        let views = samples
            .iter()
            .map(|s| PlanarView {
                object_points: self.object_points.clone(),
                image_points: s.image_points.clone(),
            })
            .collect();
        let mut cost = PlanarCalibrationCost::new(resolution, views);
        cost.linear_estimation()
            .map_err(|e| CalibrationError::Fit(e.to_string()))?;
        cost.optimize(false)
            .map_err(|e| CalibrationError::Fit(e.to_string()))?;

        let reprojection_error = cost.rms_error();
        if !reprojection_error.is_finite() {
            return Err(CalibrationError::Fit(
                "reprojection error is not finite".to_string(),
            ));
        }
        Ok(Fit {
            model: IntrinsicModel {
                lens: *cost.model(),
                sample_count: samples.len(),
                reprojection_error,
            },
            view_errors: cost.view_errors(),
        })
    }

    /// Samples to keep: those at or under the error cutoff, never fewer than
    /// `min_samples_kept` (the best ones are kept then).
    fn retained_indices(&self, errors: &[f64]) -> Vec<usize> {
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let stddev = (errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n).sqrt();
        let cutoff = (mean + self.config.cleaning.stddev_factor * stddev)
            .max(self.config.cleaning.min_error);

        let mut order: Vec<usize> = (0..errors.len()).collect();
        order.sort_by(|&a, &b| errors[a].total_cmp(&errors[b]));
        let mut keep: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|&(rank, &i)| errors[i] <= cutoff || rank < self.config.min_samples_kept)
            .map(|(_, &i)| i)
            .collect();
        keep.sort_unstable();
        keep
    }

    /// Drops outlier samples and refits. The reprojection error afterwards is
    /// never above the error before cleaning.
    fn clean(&mut self, resolution: Resolution) {
        let Some(before) = self.model else {
            return;
        };
        let errors = self.sample_errors.clone();
        if errors.len() != self.samples.len() {
            return;
        }
        let keep = self.retained_indices(&errors);
        if keep.len() == self.samples.len() {
            return;
        }

        let retained: Vec<Sample> = keep.iter().map(|&i| self.samples[i].clone()).collect();
        let retained_errors: Vec<f64> = keep.iter().map(|&i| errors[i]).collect();
        // Same point count per sample, so the retained RMS is the RMS of the
        // per-sample errors.
        let retained_rms = (retained_errors.iter().map(|e| e * e).sum::<f64>()
            / retained_errors.len() as f64)
            .sqrt();

        let fallback = Fit {
            model: IntrinsicModel {
                sample_count: retained.len(),
                reprojection_error: retained_rms,
                ..before
            },
            view_errors: retained_errors,
        };
        let fit = match self.fit(&retained, resolution) {
            Ok(fit) if fit.model.reprojection_error <= fallback.model.reprojection_error => fit,
            Ok(_) => {
                debug!("Refit after cleaning did not improve, keeping previous model");
                fallback
            }
            Err(err) => {
                warn!("Refit after cleaning failed, keeping previous model: {}", err);
                fallback
            }
        };

        info!(
            "Cleaned {} samples, reprojection error {:.4} -> {:.4} px",
            self.samples.len() - retained.len(),
            before.reprojection_error,
            fit.model.reprojection_error
        );
        self.samples = retained;
        self.sample_errors = fit.view_errors;
        self.model = Some(fit.model);
    }
}
