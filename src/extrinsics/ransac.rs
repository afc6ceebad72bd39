//! Consensus sampling and the planar perspective-n-point estimator built on
//! it.
//!
//! [`ransac`] is model agnostic: implement [`Estimator`] for a model and it
//! returns the best consensus found within the iteration budget, or `None`.

use crate::camera::RadTanModel;
use crate::optimization::{
    planar_pose_from_points, project_point, Optimizer, PoseRefinementCost, ViewPose,
};

use log::debug;
use nalgebra::{Point2, Point3};
use rand::{rngs::StdRng, SeedableRng};

#[derive(Debug, Clone, PartialEq)]
pub struct RansacOptions {
    /// Upper bound on the number of iterations.
    pub max_iters: usize,
    /// Inlier residual threshold, in the units of [`Estimator::residual`].
    pub threshold: f64,
    /// Fraction of the data that must agree with the model.
    pub min_inlier_ratio: f64,
    /// Confidence used to shrink the iteration bound as inliers are found.
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        RansacOptions {
            max_iters: 100,
            threshold: 8.0,
            min_inlier_ratio: 0.5,
            confidence: 0.99,
            seed: 0x5eed_ca1b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: M,
    pub inliers: Vec<usize>,
    /// RMS residual over the inliers.
    pub inlier_rms: f64,
    pub iterations: usize,
}

pub trait Estimator {
    type Datum;
    type Model: Clone;

    /// Size of a minimal sample.
    const MIN_SAMPLES: usize;

    /// Model from the data at `sample`, or `None` for a degenerate sample.
    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual of one datum.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;

    /// Re-estimates the model from all inliers. Defaults to no refit.
    fn refit(
        &self,
        _data: &[Self::Datum],
        _inliers: &[usize],
        _model: &Self::Model,
    ) -> Option<Self::Model> {
        None
    }
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Iterations needed to draw one all-inlier sample with `confidence`.
fn required_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n = ((1.0 - confidence.min(1.0 - 1e-12)).ln() / denom).ceil();
    (n as usize).min(max_iters)
}

fn score<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    model: &E::Model,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, datum) in data.iter().enumerate() {
        let r = estimator.residual(model, datum);
        if r.is_finite() && r <= threshold {
            inliers.push(i);
            residuals.push(r);
        }
    }
    let error = rms(&residuals);
    (inliers, error)
}

/// Runs consensus sampling for `estimator` over `data`.
///
/// Returns `None` when there is too little data or no model reaches
/// `min_inlier_ratio` of the data.
pub fn ransac<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    opts: &RansacOptions,
) -> Option<RansacResult<E::Model>> {
    if data.len() < E::MIN_SAMPLES {
        return None;
    }
    let min_inliers =
        ((opts.min_inlier_ratio * data.len() as f64).ceil() as usize).max(E::MIN_SAMPLES);
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut best: Option<RansacResult<E::Model>> = None;
    let mut max_iters = opts.max_iters;
    let mut iterations = 0;
    while iterations < max_iters {
        iterations += 1;
        let sample = rand::seq::index::sample(&mut rng, data.len(), E::MIN_SAMPLES).into_vec();
        let Some(model) = estimator.fit(data, &sample) else {
            continue;
        };
        let (inliers, inlier_rms) = score(estimator, data, &model, opts.threshold);
        let better = match &best {
            None => !inliers.is_empty(),
            Some(b) => {
                inliers.len() > b.inliers.len()
                    || (inliers.len() == b.inliers.len() && inlier_rms < b.inlier_rms)
            }
        };
        if better {
            let ratio = inliers.len() as f64 / data.len() as f64;
            max_iters =
                required_iterations(opts.confidence, ratio, E::MIN_SAMPLES, opts.max_iters)
                    .max(iterations);
            best = Some(RansacResult {
                model,
                inliers,
                inlier_rms,
                iterations,
            });
        }
    }

    let mut best = best?;
    best.iterations = iterations;
    if best.inliers.len() < min_inliers {
        debug!(
            "Consensus of {} inliers below the required {}",
            best.inliers.len(),
            min_inliers
        );
        return None;
    }

    if let Some(refined) = estimator.refit(data, &best.inliers, &best.model) {
        let (inliers, inlier_rms) = score(estimator, data, &refined, opts.threshold);
        if inliers.len() >= best.inliers.len() {
            best.model = refined;
            best.inliers = inliers;
            best.inlier_rms = inlier_rms;
        }
    }
    Some(best)
}

/// One object point and where it was detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub object: Point3<f64>,
    pub image: Point2<f64>,
}

/// Pose of a planar pattern from four-point homographies, scored by pixel
/// reprojection error under the lens model.
#[derive(Debug, Clone)]
pub struct PlanarPnpEstimator {
    pub lens: RadTanModel,
}

impl Estimator for PlanarPnpEstimator {
    type Datum = Correspondence;
    type Model = ViewPose;

    const MIN_SAMPLES: usize = 4;

    fn fit(&self, data: &[Correspondence], sample: &[usize]) -> Option<ViewPose> {
        let object: Vec<Point3<f64>> = sample.iter().map(|&i| data[i].object).collect();
        let image: Vec<Point2<f64>> = sample.iter().map(|&i| data[i].image).collect();
        let pose = planar_pose_from_points(&self.lens, &object, &image)?;
        (pose.tvec.z > 0.0).then_some(pose)
    }

    fn residual(&self, pose: &ViewPose, datum: &Correspondence) -> f64 {
        let i = &self.lens.intrinsics;
        let [u, v] = project_point(
            &[i.fx, i.fy, i.cx, i.cy],
            &self.lens.distortions,
            &[pose.rvec.x, pose.rvec.y, pose.rvec.z],
            &[pose.tvec.x, pose.tvec.y, pose.tvec.z],
            &[datum.object.x, datum.object.y, datum.object.z],
        );
        ((u - datum.image.x).powi(2) + (v - datum.image.y).powi(2)).sqrt()
    }

    fn refit(
        &self,
        data: &[Correspondence],
        inliers: &[usize],
        model: &ViewPose,
    ) -> Option<ViewPose> {
        let object = inliers.iter().map(|&i| data[i].object).collect();
        let image = inliers.iter().map(|&i| data[i].image).collect();
        let mut cost =
            PoseRefinementCost::new(self.lens, object, image).with_initial_pose(*model);
        cost.optimize(false).ok()?;
        cost.pose()
    }
}

/// Robust pose of a planar pattern from its detected image points.
pub fn solve_pnp_ransac(
    lens: &RadTanModel,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    opts: &RansacOptions,
) -> Option<RansacResult<ViewPose>> {
    if object_points.len() != image_points.len() {
        return None;
    }
    let data: Vec<Correspondence> = object_points
        .iter()
        .zip(image_points.iter())
        .map(|(&object, &image)| Correspondence { object, image })
        .collect();
    ransac(&PlanarPnpEstimator { lens: *lens }, &data, opts)
}
