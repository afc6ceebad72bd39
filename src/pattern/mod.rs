//! Fiducial pattern geometry and the settings document that describes it.
//!
//! A [`PatternModel`] owns a validated [`PatternSpec`] and generates the
//! reference object-plane points (`z = 0`) for every pattern node, row-major.

use crate::error::{CalibrationError, Result};
use log::{info, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use yaml_rust::{Yaml, YamlLoader};

pub mod detector;

pub use detector::{BlobGridDetector, PatternDetector};

/// Margin factor used for extrinsic object points: the reference grid is
/// shrunk to 75% of the true square size and centred on the board.
pub const DEFAULT_MARGIN_FACTOR: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternType {
    Chessboard,
    CirclesGrid,
    AsymmetricCirclesGrid,
}

impl PatternType {
    /// Integer code used by the settings and intrinsics documents.
    pub fn code(self) -> i64 {
        match self {
            PatternType::Chessboard => 0,
            PatternType::CirclesGrid => 1,
            PatternType::AsymmetricCirclesGrid => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PatternType::Chessboard),
            1 => Some(PatternType::CirclesGrid),
            2 => Some(PatternType::AsymmetricCirclesGrid),
            _ => None,
        }
    }
}

/// Pattern geometry: node grid size and physical square (or circle) pitch.
///
/// For a chessboard `columns × rows` counts inner corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern_type: PatternType,
    pub columns: i32,
    pub rows: i32,
    pub square_size: f64,
}

impl Default for PatternSpec {
    fn default() -> Self {
        PatternSpec {
            pattern_type: PatternType::Chessboard,
            columns: 10,
            rows: 7,
            square_size: 2.5,
        }
    }
}

impl PatternSpec {
    pub fn validate(&self) -> Result<()> {
        if self.columns <= 0 || self.rows <= 0 {
            return Err(CalibrationError::Config(format!(
                "pattern size must be positive, got {}x{}",
                self.columns, self.rows
            )));
        }
        if !(self.square_size > 0.0) || !self.square_size.is_finite() {
            return Err(CalibrationError::Config(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        (self.columns.max(0) as usize) * (self.rows.max(0) as usize)
    }

    /// Reads the settings document (`xCount`, `yCount`, `squareSize`,
    /// `patternType`).
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Persistence`] when the file cannot be read and
    /// [`CalibrationError::Config`] when it is not a valid settings document.
    pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let docs = YamlLoader::load_from_str(strip_opencv_directive(&contents))
            .map_err(|e| CalibrationError::Config(e.to_string()))?;
        let doc = docs
            .first()
            .ok_or_else(|| CalibrationError::Config("Empty settings document".to_string()))?;

        let columns = yaml_integer(&doc["xCount"], "xCount")?;
        let rows = yaml_integer(&doc["yCount"], "yCount")?;
        let square_size = yaml_number(&doc["squareSize"], "squareSize")?;
        let code = yaml_integer(&doc["patternType"], "patternType")?;
        let pattern_type = PatternType::from_code(code).ok_or_else(|| {
            CalibrationError::Config(format!("Unknown patternType {}", code))
        })?;

        let spec = PatternSpec {
            pattern_type,
            columns: yaml_count(columns, "xCount")?,
            rows: yaml_count(rows, "yCount")?,
            square_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Loads the settings document, falling back to the built-in defaults
    /// when the file does not exist.
    pub fn load_settings_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Settings document {:?} not found, using default pattern",
                path
            );
            return Ok(PatternSpec::default());
        }
        PatternSpec::load_settings(path)
    }
}

/// OpenCV writes `%YAML:1.0`, which is not a valid YAML directive.
pub(crate) fn strip_opencv_directive(contents: &str) -> &str {
    let trimmed = contents.trim_start();
    if trimmed.starts_with("%YAML:") {
        match trimmed.find('\n') {
            Some(idx) => &trimmed[idx + 1..],
            None => "",
        }
    } else {
        contents
    }
}

fn yaml_integer(node: &Yaml, key: &str) -> Result<i64> {
    node.as_i64()
        .ok_or_else(|| CalibrationError::Config(format!("Missing or invalid {}", key)))
}

fn yaml_count(value: i64, key: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| CalibrationError::Config(format!("{} {} is out of range", key, value)))
}

fn yaml_number(node: &Yaml, key: &str) -> Result<f64> {
    node.as_f64()
        .or_else(|| node.as_i64().map(|v| v as f64))
        .ok_or_else(|| CalibrationError::Config(format!("Missing or invalid {}", key)))
}

/// Reference points on the `z = 0` plane, one per pattern node, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPointSet {
    pub points: Vec<Point3<f64>>,
    pub margin_factor: f64,
}

impl ObjectPointSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The points as plane coordinates `(x, y)`.
    pub fn planar(&self) -> Vec<Point2<f64>> {
        self.points.iter().map(|p| Point2::new(p.x, p.y)).collect()
    }
}

/// A validated pattern description.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternModel {
    spec: PatternSpec,
}

impl PatternModel {
    /// Validates `spec` and wraps it.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Config`] if the grid size or square size is not
    /// positive.
    pub fn configure(spec: PatternSpec) -> Result<Self> {
        spec.validate()?;
        Ok(PatternModel { spec })
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    /// Object points for every node, laid out row-major.
    ///
    /// With `margin_factor < 1` the pitch shrinks to `margin_factor ·
    /// square_size` and the grid is offset by `(1 - margin_factor) · extent / 2`
    /// on each axis, so it sits centred inside the true board area.
    pub fn build_object_points(&self, margin_factor: f64) -> Result<ObjectPointSet> {
        if !(margin_factor > 0.0 && margin_factor <= 1.0) {
            return Err(CalibrationError::Config(format!(
                "margin factor must lie in (0, 1], got {}",
                margin_factor
            )));
        }
        let square = self.spec.square_size;
        let pitch = square * margin_factor;
        let columns = self.spec.columns as usize;
        let rows = self.spec.rows as usize;

        let offset_x = (columns as f64 * square) * (1.0 - margin_factor) / 2.0;
        let offset_y = (rows as f64 * square) * (1.0 - margin_factor) / 2.0;

        let mut points = Vec::with_capacity(columns * rows);
        for i in 0..rows {
            for j in 0..columns {
                let column_index = match self.spec.pattern_type {
                    PatternType::AsymmetricCirclesGrid => (2 * j + i % 2) as f64,
                    _ => j as f64,
                };
                points.push(Point3::new(
                    column_index * pitch + offset_x,
                    i as f64 * pitch + offset_y,
                    0.0,
                ));
            }
        }
        if margin_factor < 1.0 {
            info!(
                "Created {} object points with margin factor {}",
                points.len(),
                margin_factor
            );
        }
        Ok(ObjectPointSet {
            points,
            margin_factor,
        })
    }
}

impl Default for PatternModel {
    fn default() -> Self {
        PatternModel {
            spec: PatternSpec::default(),
        }
    }
}

/// Warns when a detection does not carry one point per pattern node.
pub(crate) fn check_detection(spec: &PatternSpec, points: &[Point2<f64>]) -> bool {
    if points.len() != spec.node_count() {
        warn!(
            "Detector returned {} points, pattern has {} nodes",
            points.len(),
            spec.node_count()
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn chessboard(columns: i32, rows: i32, square_size: f64) -> PatternSpec {
        PatternSpec {
            pattern_type: PatternType::Chessboard,
            columns,
            rows,
            square_size,
        }
    }

    #[test]
    fn test_configure_rejects_invalid() {
        assert!(matches!(
            PatternModel::configure(chessboard(0, 6, 25.0)),
            Err(CalibrationError::Config(_))
        ));
        assert!(matches!(
            PatternModel::configure(chessboard(9, -1, 25.0)),
            Err(CalibrationError::Config(_))
        ));
        assert!(matches!(
            PatternModel::configure(chessboard(9, 6, 0.0)),
            Err(CalibrationError::Config(_))
        ));
        assert!(PatternModel::configure(chessboard(9, 6, 25.0)).is_ok());
    }

    #[test]
    fn test_object_points_true_board() {
        let model = PatternModel::configure(chessboard(9, 6, 25.0)).unwrap();
        let set = model.build_object_points(1.0).unwrap();
        assert_eq!(set.len(), 54);
        assert_eq!(set.points[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(set.points[1], Point3::new(25.0, 0.0, 0.0));
        assert_eq!(set.points[9], Point3::new(0.0, 25.0, 0.0));
        assert_eq!(set.points[53], Point3::new(200.0, 125.0, 0.0));
        assert!(set.points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_object_points_with_margin() {
        let model = PatternModel::configure(chessboard(9, 6, 25.0)).unwrap();
        let set = model.build_object_points(DEFAULT_MARGIN_FACTOR).unwrap();
        let pitch = 25.0 * 0.75;
        let offset_x = 9.0 * 25.0 * 0.25 / 2.0;
        let offset_y = 6.0 * 25.0 * 0.25 / 2.0;

        assert_relative_eq!(set.points[0].x, offset_x);
        assert_relative_eq!(set.points[0].y, offset_y);
        assert_relative_eq!(set.points[1].x - set.points[0].x, pitch);
        assert_relative_eq!(set.points[9].y - set.points[0].y, pitch);
        assert_eq!(set.margin_factor, 0.75);
    }

    #[test]
    fn test_object_points_rejects_bad_margin() {
        let model = PatternModel::default();
        assert!(model.build_object_points(0.0).is_err());
        assert!(model.build_object_points(1.5).is_err());
    }

    #[test]
    fn test_asymmetric_layout() {
        let spec = PatternSpec {
            pattern_type: PatternType::AsymmetricCirclesGrid,
            columns: 4,
            rows: 3,
            square_size: 1.0,
        };
        let set = PatternModel::configure(spec)
            .unwrap()
            .build_object_points(1.0)
            .unwrap();
        assert_eq!(set.points[4], Point3::new(1.0, 1.0, 0.0));
        assert_eq!(set.points[5], Point3::new(3.0, 1.0, 0.0));
    }

    #[test]
    fn test_load_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "%YAML:1.0\nxCount: 9\nyCount: 6\nsquareSize: 25\npatternType: 1"
        )
        .unwrap();

        let spec = PatternSpec::load_settings(file.path()).unwrap();
        assert_eq!(spec.columns, 9);
        assert_eq!(spec.rows, 6);
        assert_eq!(spec.square_size, 25.0);
        assert_eq!(spec.pattern_type, PatternType::CirclesGrid);
    }

    #[test]
    fn test_load_settings_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PatternSpec::load_settings_or_default(dir.path().join("settings.yml")).unwrap();
        assert_eq!(spec, PatternSpec::default());
    }

    #[test]
    fn test_load_settings_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "xCount: nine\nyCount: 6\nsquareSize: 2.5\npatternType: 0").unwrap();
        assert!(matches!(
            PatternSpec::load_settings(file.path()),
            Err(CalibrationError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "xCount: 9\nyCount: 6\nsquareSize: 2.5\npatternType: 7").unwrap();
        assert!(matches!(
            PatternSpec::load_settings(file.path()),
            Err(CalibrationError::Config(_))
        ));
    }

    #[test]
    fn test_load_settings_count_out_of_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "xCount: 4294967297\nyCount: 6\nsquareSize: 2.5\npatternType: 0").unwrap();
        assert!(matches!(
            PatternSpec::load_settings(file.path()),
            Err(CalibrationError::Config(_))
        ));
    }
}
