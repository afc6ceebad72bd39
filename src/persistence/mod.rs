//! Intrinsics and extrinsics documents.
//!
//! Both documents are YAML. The intrinsics document is a flat mapping:
//!
//! ```yaml
//! cameraMatrix: [fx, 0, cx, 0, fy, cy, 0, 0, 1]
//! distCoeffs: [k1, k2, p1, p2, k3]
//! imageSize_width: 640
//! imageSize_height: 480
//! patternType: 0
//! xCount: 9
//! yCount: 6
//! squareSize: 25.0
//! reprojectionError: 0.21
//! sampleCount: 8
//! ```
//!
//! The extrinsics document holds `rvec`, `tvec`, the detected image points
//! (`features`), the object points they were matched to and the full
//! `mapping`.

use crate::camera::validation::validate_resolution;
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::error::{CalibrationError, Result};
use crate::extrinsics::Pose;
use crate::intrinsics::IntrinsicModel;
use crate::pattern::{strip_opencv_directive, PatternSpec, PatternType};
use crate::remap::TransformMap;

use log::info;
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

pub const INTRINSICS_FILE: &str = "calibrationIntrinsics.yml";
pub const EXTRINSICS_FILE: &str = "calibrationExtrinsics.yml";

/// Where the engine keeps its documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationPaths {
    pub intrinsics: PathBuf,
    pub extrinsics: PathBuf,
}

impl CalibrationPaths {
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        CalibrationPaths {
            intrinsics: dir.join(INTRINSICS_FILE),
            extrinsics: dir.join(EXTRINSICS_FILE),
        }
    }
}

/// A loaded intrinsics document.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicsDocument {
    pub model: IntrinsicModel,
    /// Pattern the model was calibrated with.
    pub pattern: PatternSpec,
}

fn entry<T: Serialize>(key: &str, value: T) -> Result<(Value, Value)> {
    Ok((Value::String(key.to_string()), serde_yaml::to_value(value)?))
}

pub fn save_intrinsics<P: AsRef<Path>>(
    path: P,
    model: &IntrinsicModel,
    pattern: &PatternSpec,
) -> Result<()> {
    let k = model.camera_matrix();
    // Row-major, as a 3x3 matrix reads.
    let camera_matrix: Vec<f64> = (0..3)
        .flat_map(|r| (0..3).map(move |c| k[(r, c)]))
        .collect();
    let resolution = model.resolution();
    let mapping = Mapping::from_iter([
        entry("cameraMatrix", camera_matrix)?,
        entry("distCoeffs", model.distortion_coefficients().to_vec())?,
        entry("imageSize_width", resolution.width)?,
        entry("imageSize_height", resolution.height)?,
        entry("patternType", pattern.pattern_type.code())?,
        entry("xCount", pattern.columns)?,
        entry("yCount", pattern.rows)?,
        entry("squareSize", pattern.square_size)?,
        entry("reprojectionError", model.reprojection_error)?,
        entry("sampleCount", model.sample_count)?,
    ]);
    let yaml_string = serde_yaml::to_string(&mapping)?;
    fs::write(path.as_ref(), yaml_string)?;
    info!("Saved intrinsics to {:?}", path.as_ref());
    Ok(())
}

fn invalid(key: &str) -> CalibrationError {
    CalibrationError::Persistence(format!("Missing or invalid {}", key))
}

fn number(doc: &Yaml, key: &str) -> Result<f64> {
    let node = &doc[key];
    node.as_f64()
        .or_else(|| node.as_i64().map(|v| v as f64))
        .ok_or_else(|| invalid(key))
}

fn integer(doc: &Yaml, key: &str) -> Result<i64> {
    doc[key].as_i64().ok_or_else(|| invalid(key))
}

fn dimension(doc: &Yaml, key: &str) -> Result<u32> {
    u32::try_from(integer(doc, key)?).map_err(|_| invalid(key))
}

fn count(doc: &Yaml, key: &str) -> Result<i32> {
    i32::try_from(integer(doc, key)?).map_err(|_| invalid(key))
}

fn numbers(doc: &Yaml, key: &str, len: usize) -> Result<Vec<f64>> {
    let values = doc[key].as_vec().ok_or_else(|| invalid(key))?;
    if values.len() != len {
        return Err(CalibrationError::Persistence(format!(
            "{} holds {} values, expected {}",
            key,
            values.len(),
            len
        )));
    }
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .or_else(|| v.as_i64().map(|i| i as f64))
                .ok_or_else(|| invalid(key))
        })
        .collect()
}

/// Reads an intrinsics document written by [`save_intrinsics`].
///
/// # Errors
///
/// [`CalibrationError::Persistence`] when the file is missing, unparsable,
/// incomplete or describes an invalid lens.
pub fn load_intrinsics<P: AsRef<Path>>(path: P) -> Result<IntrinsicsDocument> {
    let contents = fs::read_to_string(path.as_ref())?;
    let docs = YamlLoader::load_from_str(strip_opencv_directive(&contents))?;
    let doc = docs
        .first()
        .ok_or_else(|| CalibrationError::Persistence("Empty intrinsics document".to_string()))?;

    let k = numbers(doc, "cameraMatrix", 9)?;
    let distortion = numbers(doc, "distCoeffs", 5)?;
    let resolution = Resolution::new(
        dimension(doc, "imageSize_width")?,
        dimension(doc, "imageSize_height")?,
    );
    validate_resolution(&resolution).map_err(|e| CalibrationError::Persistence(e.to_string()))?;
    let lens = RadTanModel {
        intrinsics: Intrinsics::from_camera_matrix(&Matrix3::from_row_slice(&k)),
        resolution,
        distortions: [
            distortion[0],
            distortion[1],
            distortion[2],
            distortion[3],
            distortion[4],
        ],
    };
    lens.validate_params()
        .map_err(|e| CalibrationError::Persistence(e.to_string()))?;

    let code = integer(doc, "patternType")?;
    let pattern = PatternSpec {
        pattern_type: PatternType::from_code(code).ok_or_else(|| invalid("patternType"))?,
        columns: count(doc, "xCount")?,
        rows: count(doc, "yCount")?,
        square_size: number(doc, "squareSize")?,
    };
    pattern
        .validate()
        .map_err(|e| CalibrationError::Persistence(e.to_string()))?;

    let model = IntrinsicModel {
        lens,
        sample_count: integer(doc, "sampleCount")?.max(0) as usize,
        reprojection_error: number(doc, "reprojectionError")?,
    };
    info!("Loaded intrinsics from {:?}", path.as_ref());
    Ok(IntrinsicsDocument { model, pattern })
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtrinsicsDocument {
    rvec: [f64; 3],
    tvec: [f64; 3],
    features: Vec<[f64; 2]>,
    #[serde(default)]
    object_points: Vec<[f64; 3]>,
    mapping: TransformMap,
}

pub fn save_extrinsics<P: AsRef<Path>>(path: P, pose: &Pose, map: &TransformMap) -> Result<()> {
    let document = ExtrinsicsDocument {
        rvec: pose.rvec.into(),
        tvec: pose.tvec.into(),
        features: pose.image_points.iter().map(|p| [p.x, p.y]).collect(),
        object_points: pose.object_points.iter().map(|p| [p.x, p.y, p.z]).collect(),
        mapping: map.clone(),
    };
    let yaml_string = serde_yaml::to_string(&document)?;
    fs::write(path.as_ref(), yaml_string)?;
    info!("Saved extrinsics to {:?}", path.as_ref());
    Ok(())
}

/// Reads an extrinsics document written by [`save_extrinsics`].
///
/// # Errors
///
/// [`CalibrationError::Persistence`] when the file is missing, unparsable or
/// its map does not match its dimensions.
pub fn load_extrinsics<P: AsRef<Path>>(path: P) -> Result<(Pose, TransformMap)> {
    let contents = fs::read_to_string(path.as_ref())?;
    let document: ExtrinsicsDocument = serde_yaml::from_str(strip_opencv_directive(&contents))?;
    validate_resolution(&document.mapping.resolution())
        .map_err(|e| CalibrationError::Persistence(e.to_string()))?;
    document.mapping.validate()?;
    let finite = document
        .rvec
        .iter()
        .chain(document.tvec.iter())
        .all(|v| v.is_finite());
    if !finite {
        return Err(CalibrationError::Persistence(
            "pose is not finite".to_string(),
        ));
    }

    let pose = Pose {
        rvec: Vector3::from(document.rvec),
        tvec: Vector3::from(document.tvec),
        image_points: document
            .features
            .iter()
            .map(|&[x, y]| Point2::new(x, y))
            .collect(),
        object_points: document
            .object_points
            .iter()
            .map(|&[x, y, z]| Point3::new(x, y, z))
            .collect(),
    };
    info!("Loaded extrinsics from {:?}", path.as_ref());
    Ok((pose, document.mapping))
}
