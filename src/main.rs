//! Offline calibration from image files.
//!
//! Usage:
//! ```bash
//! cargo run --release -- \
//!   --settings settings.yml \
//!   --output-dir calibration \
//!   --intrinsic-frames frames/board_*.png \
//!   --extrinsic-frame frames/plane.png \
//!   --rectified rectified.png
//! ```
//!
//! Each intrinsic file is treated as a still camera held on one view: it is
//! repeated `1 / fps` seconds apart until the motion and timing gates let it
//! through.

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use std::path::PathBuf;
use surface_calibration::util::{export_point_correspondences, export_report_json, load_frame};
use surface_calibration::{CalibrationEngine, EngineConfig, Milestone};

/// Camera calibration against a planar pattern
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings document with the pattern description
    #[arg(short = 's', long, default_value = "settings.yml")]
    settings: PathBuf,

    /// Directory for the calibration documents and reports
    #[arg(short = 'o', long, default_value = "output")]
    output_dir: PathBuf,

    /// Frame rate the intrinsic frames are assumed to be taken at
    #[arg(long, default_value = "1.0")]
    fps: f64,

    /// Views of the pattern for intrinsic calibration, in capture order
    #[arg(short = 'i', long, num_args = 1..)]
    intrinsic_frames: Vec<PathBuf>,

    /// View of the pattern lying on the reference plane
    #[arg(short = 'e', long)]
    extrinsic_frame: Option<PathBuf>,

    /// Where to write the rectified extrinsic frame
    #[arg(short = 'r', long)]
    rectified: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_env_or_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .start()?;

    let cli = Cli::parse();
    if !(cli.fps > 0.0) {
        return Err("fps must be positive".into());
    }
    std::fs::create_dir_all(&cli.output_dir)?;

    let config = EngineConfig::default();
    let hold = (config.gate.time_threshold * cli.fps).ceil() as usize + 2;
    let mut engine = CalibrationEngine::from_settings(&cli.settings, &cli.output_dir, config)?;
    info!("Pattern: {:?}", engine.pattern().spec());

    if cli.intrinsic_frames.is_empty() {
        if !engine.load_intrinsics() {
            return Err("no intrinsic frames given and no saved intrinsics found".into());
        }
        info!("Using saved intrinsics");
    } else {
        calibrate_intrinsics(&mut engine, &cli, hold)?;
    }

    let Some(path) = &cli.extrinsic_frame else {
        return Ok(());
    };
    let frame = load_frame(path)?;
    // A frame that differs from the last one seen only settles the motion gate.
    let mut milestone = engine.update_extrinsics(&frame)?;
    if let Milestone::Waiting { .. } = milestone {
        milestone = engine.update_extrinsics(&frame)?;
    }
    if milestone != Milestone::ExtrinsicsSolved {
        error!("No pose solved from {:?}: {:?}", path, milestone);
        return Err("extrinsic calibration failed".into());
    }

    let report = engine.reprojection_report()?;
    export_report_json(&report, cli.output_dir.join("reprojection.json"))?;
    if let Some(pose) = engine.pose() {
        export_point_correspondences(
            &pose.object_points,
            &pose.image_points,
            cli.output_dir.join("correspondences.csv"),
        )?;
    }
    if let Some(out) = &cli.rectified {
        engine.rectify(&frame)?.save(out)?;
        info!("Rectified frame written to {:?}", out);
    }
    Ok(())
}

fn calibrate_intrinsics(
    engine: &mut CalibrationEngine,
    cli: &Cli,
    hold: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    engine.start_intrinsics();
    let step = 1.0 / cli.fps;
    let mut now = 0.0;
    for path in &cli.intrinsic_frames {
        let frame = load_frame(path)?;
        for _ in 0..hold {
            now += step;
            match engine.update_intrinsics(&frame, now) {
                Ok(Milestone::Waiting { .. }) => continue,
                Ok(Milestone::PatternNotFound) => warn!("Pattern not found in {:?}", path),
                Ok(Milestone::PatternFound {
                    samples,
                    reprojection_error,
                }) => info!(
                    "{:?}: {} samples, reprojection error {:.4} px",
                    path, samples, reprojection_error
                ),
                Ok(Milestone::IntrinsicsReady) => return Ok(()),
                Ok(other) => warn!("Unexpected milestone {:?}", other),
                Err(err) => warn!("{:?}: {}", path, err),
            }
            break;
        }
    }
    Err(format!(
        "intrinsics did not converge after {} frames",
        cli.intrinsic_frames.len()
    )
    .into())
}
