use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use rust_marker_nav::config::NavConfig;
use rust_marker_nav::io::save_tip_offset;
use rust_marker_nav::system::{NavigationSystem, TrackedBody};
use rust_marker_nav::tracking::{MarkerDetector, RecordedDetector, TrackingState};

const USAGE: &str = "\
usage:
  rust_marker_nav track <recording.csv> [config.yaml]
  rust_marker_nav calibrate-body <recording.csv> <reference|tool> <out.json> [config.yaml]
  rust_marker_nav pivot <recording.csv> <out.json> [config.yaml]
  rust_marker_nav scale <recording.csv> <expected_mm> <out.json> [config.yaml]";

/// Frames at each end of a scale recording taken as the rest positions.
const SCALE_REST_FRAMES: usize = 15;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("track") if args.len() >= 2 => track(&args[1], args.get(2)),
        Some("calibrate-body") if args.len() >= 4 => {
            let body = match args[2].as_str() {
                "reference" => TrackedBody::Reference,
                "tool" => TrackedBody::Tool,
                other => bail!("Unknown body '{}', expected reference or tool", other),
            };
            calibrate_body(&args[1], body, &args[3], args.get(4))
        }
        Some("pivot") if args.len() >= 3 => pivot(&args[1], &args[2], args.get(3)),
        Some("scale") if args.len() >= 4 => {
            let expected_mm: f64 = args[2]
                .parse()
                .with_context(|| format!("Invalid test distance '{}'", args[2]))?;
            scale(&args[1], expected_mm, &args[3], args.get(4))
        }
        _ => {
            eprintln!("{}", USAGE);
            bail!("Invalid arguments");
        }
    }
}

fn load_config(path: Option<&String>) -> Result<NavConfig> {
    match path {
        Some(p) => NavConfig::load(p),
        None => {
            info!("No config given, using defaults");
            Ok(NavConfig::default())
        }
    }
}

fn load_session(path: &str) -> Result<RecordedDetector> {
    let detector = RecordedDetector::from_path(path)
        .with_context(|| format!("Failed to load recording {}", path))?;
    if detector.is_empty() {
        bail!("Recording {} has no frames", path);
    }
    info!("Loaded {} frames from {}", detector.len(), path);
    Ok(detector)
}

/// Replay a recorded session through the navigation pipeline.
fn track(recording: &str, config_path: Option<&String>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut detector = load_session(recording)?;
    let mut system = NavigationSystem::from_config(&config)?;

    let indexed: Vec<(u64, u64)> = detector
        .frames()
        .map(|f| (f.frame_index, f.timestamp_ns))
        .collect();

    let mut with_output = 0usize;
    let mut rejected = 0usize;
    for (i, (frame_index, timestamp_ns)) in indexed.iter().enumerate() {
        let frame = detector.detect_frame(frame_index, *frame_index, *timestamp_ns)?;
        let result = system.process_frame(&frame);
        rejected += result.rejected.len();

        if let Some(out) = &result.composed {
            with_output += 1;
            if i % 30 == 0 {
                let t = out.ref_to_tool.translation;
                info!(
                    "Frame {}: REF_TO_TOOL [{:.2}, {:.2}, {:.2}] mm, distance {:.2} mm",
                    frame_index,
                    t.x,
                    t.y,
                    t.z,
                    t.norm()
                );
            }
        } else if result.tool.state == TrackingState::Lost && i % 30 == 0 {
            warn!("Frame {}: tool lost", frame_index);
        }
    }

    info!(
        "Done. {} / {} frames produced a transform, {} observations rejected",
        with_output,
        indexed.len(),
        rejected
    );
    system.shutdown();
    Ok(())
}

/// Refine a body's marker offsets from a recorded calibration session.
fn calibrate_body(
    recording: &str,
    body: TrackedBody,
    out: &str,
    config_path: Option<&String>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.publisher.enabled = false;
    let detector = load_session(recording)?;
    let system = NavigationSystem::from_config(&config)?;

    let frames: Vec<_> = detector.frames().cloned().collect();
    let report = system.recalibrate_body(body, &frames, &|| false)?;
    info!(
        "RMS {:.4} px -> {:.4} px after {} iterations ({:?}); anchor marker {}",
        report.rms_before, report.rms_after, report.iterations, report.termination, report.anchor_marker
    );

    let model = system.model_handle(body).load();
    model.save(Path::new(out))?;
    info!("Wrote body model '{}' ({} markers) to {}", model.name, model.len(), out);
    Ok(())
}

/// Solve for the tool tip from a recorded pivoting session.
fn pivot(recording: &str, out: &str, config_path: Option<&String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.publisher.enabled = false;
    let detector = load_session(recording)?;
    let mut system = NavigationSystem::from_config(&config)?;

    system.start_pivot_capture();
    for frame in detector.frames() {
        system.process_frame(frame);
    }
    info!("Captured {} pivot poses", system.pivot_samples().len());

    let result = system.finish_pivot_capture()?;
    info!(
        "Tip offset [{:.3}, {:.3}, {:.3}], pivot point [{:.3}, {:.3}, {:.3}], residual RMS {:.4}, condition {:.1}",
        result.tip_offset.x,
        result.tip_offset.y,
        result.tip_offset.z,
        result.pivot_point.x,
        result.pivot_point.y,
        result.pivot_point.z,
        result.residual_rms,
        result.condition_number
    );
    save_tip_offset(out, &result.tip_offset, result.residual_rms)?;
    info!("Wrote tip offset to {}", out);
    Ok(())
}

/// Measure the tool's displacement between the rest positions at the start
/// and end of a recording, and derive the mm scale factor from it.
fn scale(recording: &str, expected_mm: f64, out: &str, config_path: Option<&String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.publisher.enabled = false;
    let detector = load_session(recording)?;
    if detector.len() < 2 * SCALE_REST_FRAMES {
        bail!(
            "Recording {} has {} frames, a scale move needs at least {}",
            recording,
            detector.len(),
            2 * SCALE_REST_FRAMES
        );
    }
    let mut system = NavigationSystem::from_config(&config)?;

    let frames: Vec<_> = detector.frames().cloned().collect();
    let start = &frames[..SCALE_REST_FRAMES];
    let end = &frames[frames.len() - SCALE_REST_FRAMES..];
    let record = system.calibrate_scale(TrackedBody::Tool, expected_mm, &[(start, end)])?;
    info!(
        "Measured {:.4} units for {:.2} mm: factor {:.4}, error {:.2}%",
        record.measured_distance_units, expected_mm, record.scale_factor, record.error_percent
    );

    record.save(out)?;
    info!("Wrote scale record to {}", out);
    Ok(())
}
