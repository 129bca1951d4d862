//! Domain error taxonomy.
//!
//! Per-frame failures in the tracking path are values of [`NavError`]; they
//! degrade to "no output this frame" and never terminate the process. File and
//! configuration loading uses `anyhow` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavError {
    #[error("marker {marker_id} rejected: reprojection RMS {rms_px:.3} px exceeds {threshold_px:.3} px")]
    ValidationRejected {
        marker_id: u32,
        rms_px: f64,
        threshold_px: f64,
    },

    #[error("no usable marker observations for body '{body}'")]
    InsufficientObservations { body: String },

    #[error("calibration diverged: RMS {rms_before:.4} px -> {rms_after:.4} px")]
    CalibrationDivergence { rms_before: f64, rms_after: f64 },

    #[error("calibration cancelled")]
    CalibrationCancelled,

    #[error("insufficient calibration data: {0}")]
    InsufficientCalibrationData(String),

    #[error("pivot calibration needs at least {required} frames, got {got}")]
    PivotTooFewFrames { required: usize, got: usize },

    #[error(
        "pivot system ill-conditioned (condition number {condition_number:.1}); \
         capture more varied instrument orientations around the pivot"
    )]
    PivotIllConditioned { condition_number: f64 },

    #[error("publish timed out after {timeout_ms} ms")]
    PublishTimeout { timeout_ms: u64 },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("invalid channel name '{0}': must be 1..=20 printable ASCII bytes")]
    InvalidChannelName(String),

    #[error("invalid transform: {0}")]
    InvalidTransform(String),

    #[error("smoothing factor {0} outside (0, 1]")]
    InvalidSmoothingFactor(f64),
}
