mod common;

use common::*;
use nalgebra::Point2;
use surface_calibration::camera::Resolution;
use surface_calibration::intrinsics::EstimatorState;
use surface_calibration::{
    CalibrationEngine, CalibrationError, CalibrationPaths, EngineConfig, Milestone, Phase,
};
use tempfile::tempdir;

/// Shows every view twice (the second showing passes the motion gate) and
/// spaces views past the sample timing gate.
fn collect_intrinsics(engine: &mut CalibrationEngine) -> usize {
    engine.start_intrinsics();
    let mut now = 0.0;
    for k in 0..12 {
        let frame = render_chessboard(&view_pose(k));
        now += 5.0;
        let first = engine.update_intrinsics(&frame, now).unwrap();
        assert!(matches!(first, Milestone::Waiting { .. }), "{:?}", first);
        now += 0.1;
        match engine.update_intrinsics(&frame, now).unwrap() {
            Milestone::IntrinsicsReady => return k + 1,
            Milestone::PatternFound { .. } | Milestone::PatternNotFound => {}
            other => panic!("unexpected milestone {:?}", other),
        }
    }
    panic!("intrinsics did not converge");
}

#[test]
fn test_chessboard_session_converges() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut engine = CalibrationEngine::new(
        chessboard(),
        CalibrationPaths::from_dir(dir.path()),
        EngineConfig::default(),
    )
    .unwrap();

    let views = collect_intrinsics(&mut engine);
    assert!(views >= 8);
    assert_eq!(engine.phase(), Phase::IntrinsicsReady);
    assert_eq!(
        engine.intrinsic_estimator().state(),
        EstimatorState::Converged
    );
    assert_eq!(engine.intrinsic_estimator().accepted_count(), 8);

    let model = engine.intrinsic_model().unwrap();
    let i = model.intrinsics();
    assert!(Resolution::new(WIDTH, HEIGHT).contains(i.cx, i.cy));
    assert!((i.fx - 800.0).abs() < 40.0, "fx {}", i.fx);
    assert!((i.fy - 800.0).abs() < 40.0, "fy {}", i.fy);
    assert!(model.reprojection_error < 1.5);
    assert!(engine.paths().intrinsics.exists());
}

#[test]
fn test_extrinsics_and_missing_pattern() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut engine = CalibrationEngine::new(
        chessboard(),
        CalibrationPaths::from_dir(dir.path()),
        EngineConfig::default(),
    )
    .unwrap();
    collect_intrinsics(&mut engine);

    // No pattern before any pose: nothing is solved.
    assert!(matches!(
        engine.update_extrinsics(&blank()).unwrap(),
        Milestone::Waiting { .. }
    ));
    assert_eq!(
        engine.update_extrinsics(&blank()).unwrap(),
        Milestone::PatternNotFound
    );
    assert!(engine.pose().is_none());

    let pose = view_pose(3);
    let board = render_chessboard(&pose);
    assert!(matches!(
        engine.update_extrinsics(&board).unwrap(),
        Milestone::Waiting { .. }
    ));
    assert_eq!(
        engine.update_extrinsics(&board).unwrap(),
        Milestone::ExtrinsicsSolved
    );
    let solved = engine.pose().unwrap().clone();

    // The inset reference grid: the true centre corner maps onto the centre
    // of the shrunk grid.
    let center_corner = surface_calibration::transform::object_to_image(
        &Point2::new(4.0 * SQUARE, 2.0 * SQUARE),
        &pose,
        &camera(),
    );
    let expected = engine.object_points().points[2 * COLUMNS as usize + 4];
    let mapped = engine.image_to_object(&center_corner).unwrap();
    assert!((mapped.x - expected.x).abs() < 1.5, "{:?}", mapped);
    assert!((mapped.y - expected.y).abs() < 1.5, "{:?}", mapped);

    // A frame without the pattern leaves the solved pose alone.
    engine.update_extrinsics(&blank()).unwrap();
    assert_eq!(
        engine.update_extrinsics(&blank()).unwrap(),
        Milestone::PatternNotFound
    );
    assert_eq!(engine.pose(), Some(&solved));
    assert_eq!(engine.phase(), Phase::Solved);

    let rectified = engine.rectify(&board).unwrap();
    assert_eq!(rectified.dimensions(), (WIDTH, HEIGHT));

    let report = engine.reprojection_report().unwrap();
    assert!(report.pixel.unwrap().rmse < 1.5);
}

#[test]
fn test_saved_session_restores() {
    init_logger();
    let dir = tempdir().unwrap();
    let paths = CalibrationPaths::from_dir(dir.path());
    let mut engine =
        CalibrationEngine::new(chessboard(), paths.clone(), EngineConfig::default()).unwrap();
    collect_intrinsics(&mut engine);
    let board = render_chessboard(&view_pose(5));
    engine.update_extrinsics(&board).unwrap();
    assert_eq!(
        engine.update_extrinsics(&board).unwrap(),
        Milestone::ExtrinsicsSolved
    );

    let mut restored =
        CalibrationEngine::new(chessboard(), paths, EngineConfig::default()).unwrap();
    assert!(restored.load_intrinsics());
    assert!(restored.load_extrinsics());
    assert_eq!(restored.phase(), Phase::Solved);

    let a = engine.intrinsic_model().unwrap().camera_matrix();
    let b = restored.intrinsic_model().unwrap().camera_matrix();
    assert!((a - b).abs().max() < 1e-6);
    assert_eq!(restored.pose().unwrap().rvec, engine.pose().unwrap().rvec);
    assert_eq!(restored.pose().unwrap().tvec, engine.pose().unwrap().tvec);

    let original = engine.map().unwrap();
    let loaded = restored.map().unwrap();
    assert_eq!(original.resolution(), loaded.resolution());
    let worst = original
        .points
        .iter()
        .zip(loaded.points.iter())
        .map(|(p, q)| (p[0] - q[0]).abs().max((p[1] - q[1]).abs()))
        .fold(0.0f32, f32::max);
    assert!(worst < 1e-3);

    // A frame of another size is refused outright.
    let small = image::GrayImage::new(320, 240);
    assert!(matches!(
        restored.rectify(&small),
        Err(CalibrationError::ResolutionMismatch { .. })
    ));
}

#[test]
fn test_corrupt_documents_are_not_loaded() {
    let dir = tempdir().unwrap();
    let paths = CalibrationPaths::from_dir(dir.path());
    std::fs::write(&paths.intrinsics, "cameraMatrix: [[[").unwrap();
    std::fs::write(&paths.extrinsics, "rvec: nope").unwrap();
    let mut engine =
        CalibrationEngine::new(chessboard(), paths, EngineConfig::default()).unwrap();
    assert!(!engine.load_intrinsics());
    assert!(!engine.load_extrinsics());
    assert_eq!(engine.phase(), Phase::Idle);
}
