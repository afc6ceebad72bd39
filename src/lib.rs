//! Surface Calibration Library
//!
//! Calibrates a camera against a planar fiducial pattern and maps camera
//! pixels onto the physical plane the pattern lies on.
//!
//! Calibration runs in two phases:
//! - Intrinsics: still, well spaced views of the pattern are collected and
//!   a radial-tangential lens model is fitted over all of them.
//! - Extrinsics: the pattern is found once more, its pose is solved robustly
//!   and a dense map from plane coordinates to camera pixels is built.
//!
//! [`engine::CalibrationEngine`] ties the phases together and persists the
//! results. The individual stages are usable on their own.

pub mod camera;
pub mod engine;
pub mod error;
pub mod extrinsics;
pub mod geometry;
pub mod intrinsics;
pub mod motion;
pub mod optimization;
pub mod pattern;
pub mod persistence;
pub mod remap;
pub mod transform;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use engine::{CalibrationEngine, EngineConfig, Milestone, Phase};
pub use error::{CalibrationError, Result};
pub use extrinsics::{ExtrinsicEstimator, Pose, SolveOutcome};
pub use intrinsics::{IntrinsicConfig, IntrinsicEstimator, IntrinsicModel};
pub use motion::{MotionGate, MotionGateConfig};
pub use pattern::{BlobGridDetector, PatternDetector, PatternModel, PatternSpec, PatternType};
pub use persistence::CalibrationPaths;
pub use remap::{TransformMap, UndistortionMapBuilder};
pub use transform::CoordinateTransformer;
