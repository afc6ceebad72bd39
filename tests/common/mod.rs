//! Synthetic camera and rendered chessboard views shared by the scenario
//! tests.

#![allow(dead_code)]

use image::{GrayImage, Luma};
use nalgebra::{Point2, Vector3};
use surface_calibration::camera::{Intrinsics, RadTanModel, Resolution};
use surface_calibration::geometry::rotation_from_vector;
use surface_calibration::pattern::{PatternModel, PatternSpec, PatternType};
use surface_calibration::transform::image_to_object;
use surface_calibration::Pose;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const SQUARE: f64 = 25.0;
pub const COLUMNS: i32 = 9;
pub const ROWS: i32 = 6;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Distortion-free camera the views are rendered with.
pub fn camera() -> RadTanModel {
    RadTanModel::pinhole(
        Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
        },
        Resolution::new(WIDTH, HEIGHT),
    )
}

pub fn chessboard() -> PatternModel {
    PatternModel::configure(PatternSpec {
        pattern_type: PatternType::Chessboard,
        columns: COLUMNS,
        rows: ROWS,
        square_size: SQUARE,
    })
    .unwrap()
}

/// Board pose of view `k`: tilted a little differently each time, centred
/// near the optical axis.
pub fn view_pose(k: usize) -> Pose {
    let a = k as f64 * 0.8;
    let rvec = Vector3::new(0.25 * a.cos(), 0.25 * a.sin(), 0.05 * a.sin());
    let r = rotation_from_vector(&rvec);
    let center = Vector3::new(
        (COLUMNS - 1) as f64 * SQUARE / 2.0,
        (ROWS - 1) as f64 * SQUARE / 2.0,
        0.0,
    );
    let offset = Vector3::new(10.0 * a.sin(), 8.0 * a.cos(), 650.0 + 20.0 * (k % 3) as f64);
    Pose::new(rvec, offset - r * center)
}

/// Renders the 9x6 inner-corner chessboard seen from `pose`. Inner corner
/// `(j, i)` lies at `(j, i) * SQUARE` on the plane.
pub fn render_chessboard(pose: &Pose) -> GrayImage {
    let lens = camera();
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let Ok(p) = image_to_object(&Point2::new(x as f64, y as f64), pose, &lens) else {
            return Luma([220u8]);
        };
        let (u, v) = (p.x / SQUARE, p.y / SQUARE);
        if u < -1.0 || v < -1.0 || u >= COLUMNS as f64 || v >= ROWS as f64 {
            return Luma([220u8]);
        }
        let sx = (u + 1.0).floor() as i64;
        let sy = (v + 1.0).floor() as i64;
        if (sx + sy) % 2 == 0 {
            Luma([30u8])
        } else {
            Luma([220u8])
        }
    })
}

pub fn blank() -> GrayImage {
    GrayImage::from_pixel(WIDTH, HEIGHT, Luma([200u8]))
}
