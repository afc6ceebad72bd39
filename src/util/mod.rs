//! Diagnostics around a solved pose: reprojection reports, exports and frame
//! loading.

use crate::camera::CameraModelError;
use crate::error::CalibrationError;
use crate::extrinsics::Pose;
use crate::intrinsics::IntrinsicModel;
use crate::optimization::{PoseRefinementCost, ProjectionError};
use crate::transform::CoordinateTransformer;

use image::GrayImage;
use log::{info, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl From<CameraModelError> for UtilError {
    fn from(err: CameraModelError) -> Self {
        UtilError::Calibration(err.into())
    }
}

/// How one correspondence of a pose maps back onto the plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointReport {
    pub image: [f64; 2],
    pub object: [f64; 2],
    /// Where the image point lands on the plane, if its ray meets it.
    pub mapped: Option<[f64; 2]>,
    /// Plane distance between `mapped` and `object`, in pattern units.
    pub plane_error: Option<f64>,
    /// Pixel distance between the image point and the projected object point.
    pub pixel_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionReport {
    pub points: Vec<PointReport>,
    /// Mean plane error over the points that map onto the plane.
    pub mean_plane_error: Option<f64>,
    pub pixel: Option<ProjectionError>,
    /// Points whose ray is parallel to the plane.
    pub degenerate: usize,
}

/// Maps every detected image point of `pose` back onto the plane and compares
/// it with the object point it was matched to.
///
/// The plane mapping ignores lens distortion (see
/// [`CoordinateTransformer::image_to_object`]), so plane errors grow with the
/// distortion at each point. Pixel errors use the full lens model.
pub fn reprojection_report(
    pose: &Pose,
    intrinsics: &IntrinsicModel,
    object_points: &[Point3<f64>],
) -> Result<ReprojectionReport, UtilError> {
    if object_points.len() != pose.image_points.len() {
        return Err(UtilError::InvalidParams(format!(
            "{} object points for {} image points",
            object_points.len(),
            pose.image_points.len()
        )));
    }
    if object_points.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }

    let transformer = CoordinateTransformer::new(pose, &intrinsics.lens);
    let pixel_errors = PoseRefinementCost::new(
        intrinsics.lens,
        object_points.to_vec(),
        pose.image_points.clone(),
    )
    .with_initial_pose(pose.view_pose())
    .point_errors();

    let mut points = Vec::with_capacity(object_points.len());
    let mut degenerate = 0;
    for ((image, object), pixel_error) in pose
        .image_points
        .iter()
        .zip(object_points.iter())
        .zip(pixel_errors.iter())
    {
        let mapped = match transformer.image_to_object(image) {
            Ok(p) => Some(p),
            Err(err) => {
                warn!("{}", err);
                degenerate += 1;
                None
            }
        };
        let plane_error = mapped.map(|p| (p - Point2::new(object.x, object.y)).norm());
        points.push(PointReport {
            image: [image.x, image.y],
            object: [object.x, object.y],
            mapped: mapped.map(|p| [p.x, p.y]),
            plane_error,
            pixel_error: *pixel_error,
        });
    }

    let plane_errors: Vec<f64> = points.iter().filter_map(|p| p.plane_error).collect();
    let mean_plane_error = (!plane_errors.is_empty())
        .then(|| plane_errors.iter().sum::<f64>() / plane_errors.len() as f64);
    let pixel = ProjectionError::from_errors(&pixel_errors);
    info!(
        "Reprojection over {} points: mean plane error {:?}, pixel {:?}",
        points.len(),
        mean_plane_error,
        pixel
    );
    Ok(ReprojectionReport {
        points,
        mean_plane_error,
        pixel,
        degenerate,
    })
}

pub fn export_report_json<P: AsRef<Path>>(
    report: &ReprojectionReport,
    path: P,
) -> Result<(), UtilError> {
    let file = File::create(path.as_ref())?;
    serde_json::to_writer_pretty(file, report)?;
    info!("Exported reprojection report to {:?}", path.as_ref());
    Ok(())
}

#[derive(Debug, Serialize)]
struct CorrespondenceRow {
    x3d: f64,
    y3d: f64,
    z3d: f64,
    x2d: f64,
    y2d: f64,
}

/// Writes `x3d,y3d,z3d,x2d,y2d` rows, one per correspondence.
pub fn export_point_correspondences<P: AsRef<Path>>(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    path: P,
) -> Result<(), UtilError> {
    if object_points.len() != image_points.len() {
        return Err(UtilError::InvalidParams(
            "3D and 2D point counts must match".to_string(),
        ));
    }
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for (object, image) in object_points.iter().zip(image_points.iter()) {
        writer.serialize(CorrespondenceRow {
            x3d: object.x,
            y3d: object.y,
            z3d: object.z,
            x2d: image.x,
            y2d: image.y,
        })?;
    }
    writer.flush()?;
    info!(
        "Exported {} point correspondences to {:?}",
        object_points.len(),
        path.as_ref()
    );
    Ok(())
}

/// Loads an image file as 8-bit grayscale.
pub fn load_frame<P: AsRef<Path>>(path: P) -> Result<GrayImage, UtilError> {
    let img = image::open(path.as_ref())?;
    Ok(img.to_luma8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, RadTanModel, Resolution};
    use crate::transform::object_to_image;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use tempfile::tempdir;

    fn intrinsics() -> IntrinsicModel {
        IntrinsicModel {
            lens: RadTanModel::pinhole(
                Intrinsics {
                    fx: 500.0,
                    fy: 500.0,
                    cx: 320.0,
                    cy: 240.0,
                },
                Resolution::new(640, 480),
            ),
            sample_count: 8,
            reprojection_error: 0.1,
        }
    }

    fn solved_pose() -> Pose {
        let mut pose = Pose::new(
            Vector3::new(0.1, 0.2, 0.0),
            Vector3::new(-50.0, -30.0, 500.0),
        );
        let lens = intrinsics().lens;
        pose.object_points = (0..4)
            .flat_map(|i| (0..5).map(move |j| Point3::new(j as f64 * 25.0, i as f64 * 25.0, 0.0)))
            .collect();
        pose.image_points = pose
            .object_points
            .iter()
            .map(|p| object_to_image(&Point2::new(p.x, p.y), &pose, &lens))
            .collect();
        pose
    }

    #[test]
    fn test_exact_pose_has_zero_error() {
        let pose = solved_pose();
        let report = reprojection_report(&pose, &intrinsics(), &pose.object_points).unwrap();
        assert_eq!(report.points.len(), 20);
        assert_eq!(report.degenerate, 0);
        assert_relative_eq!(report.mean_plane_error.unwrap(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(report.pixel.unwrap().max, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shifted_point_shows_error() {
        let mut pose = solved_pose();
        pose.image_points[3].x += 5.0;
        let report = reprojection_report(&pose, &intrinsics(), &pose.object_points).unwrap();
        assert_relative_eq!(report.points[3].pixel_error, 5.0, epsilon = 1e-6);
        assert!(report.points[3].plane_error.unwrap() > 1.0);
        assert!(report.points[0].plane_error.unwrap() < 1e-6);
    }

    #[test]
    fn test_mismatched_points_rejected() {
        let pose = solved_pose();
        let result = reprojection_report(&pose, &intrinsics(), &pose.object_points[1..]);
        assert!(matches!(result, Err(UtilError::InvalidParams(_))));
    }

    #[test]
    fn test_exports() {
        let dir = tempdir().unwrap();
        let pose = solved_pose();
        let report = reprojection_report(&pose, &intrinsics(), &pose.object_points).unwrap();

        let json_path = dir.path().join("report.json");
        export_report_json(&report, &json_path).unwrap();
        let loaded: ReprojectionReport =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(loaded.points.len(), report.points.len());

        let csv_path = dir.path().join("out").join("points.csv");
        export_point_correspondences(&pose.object_points, &pose.image_points, &csv_path).unwrap();
        let contents = fs::read_to_string(&csv_path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("x3d,y3d,z3d,x2d,y2d"));
        assert_eq!(lines.count(), 20);
    }

    #[test]
    fn test_load_frame_as_gray() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let rgb = image::RgbImage::from_pixel(8, 6, image::Rgb([90, 90, 90]));
        rgb.save(&path).unwrap();
        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.dimensions(), (8, 6));
        assert_eq!(frame.get_pixel(0, 0)[0], 90);
        assert!(load_frame(dir.path().join("missing.png")).is_err());
    }
}
