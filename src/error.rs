//! Error taxonomy of the calibration engine.
//!
//! Pattern absence is not an error: detection and gate outcomes are returned
//! as ordinary values by the estimators. The variants here are the failures a
//! caller has to react to.

use crate::camera::{CameraModelError, Resolution};

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    /// Invalid pattern description or settings document.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The intrinsic fit failed numerically; the previous model is kept.
    #[error("Intrinsic fit failed: {0}")]
    Fit(String),
    /// The robust pose solve found no consensus pose.
    #[error("Pose solve failed: {0}")]
    Solve(String),
    /// The inverse mapping is undefined at this pixel (ray parallel to the plane).
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
    /// A calibration document is missing, unreadable or could not be written.
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Operation not valid in the current state: {0}")]
    InvalidState(String),
    #[error("No extrinsic pose has been solved or loaded")]
    NoPose,
    #[error("Frame resolution {found:?} does not match session resolution {expected:?}")]
    ResolutionMismatch {
        expected: Resolution,
        found: Resolution,
    },
}

impl From<CameraModelError> for CalibrationError {
    fn from(err: CameraModelError) -> Self {
        match err {
            CameraModelError::YamlError(msg) | CameraModelError::IOError(msg) => {
                CalibrationError::Persistence(msg)
            }
            other => CalibrationError::Fit(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Persistence(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::Persistence(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CalibrationError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CalibrationError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
