//! Tracking-units to millimetre scale calibration.
//!
//! A marker is moved along a known test distance; the measured displacement in
//! tracking units gives the conversion factor. Repeating the move gives a
//! spread, reported as the worst percentage error of any single repeat.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Local;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Error percentage below which a scale calibration is accepted.
pub const MAX_ACCEPTED_ERROR_PERCENT: f64 = 5.0;

/// Persisted scale calibration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRecord {
    pub scale_factor: f64,
    pub calibrated_at: String,
    pub expected_distance_mm: f64,
    pub measured_distance_units: f64,
    pub computed_distance_mm: f64,
    pub error_percent: f64,
}

impl ScaleRecord {
    /// Whether the record meets the acceptance threshold.
    pub fn is_accepted(&self) -> bool {
        self.error_percent < MAX_ACCEPTED_ERROR_PERCENT
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scale record {}", path.display()))?;
        let record: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scale record {}", path.display()))?;
        if !record.scale_factor.is_finite() || record.scale_factor <= 0.0 {
            bail!("Scale factor {} in {} is not positive", record.scale_factor, path.display());
        }
        Ok(record)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write scale record {}", path.display()))
    }
}

/// Compute the scale factor from repeated measurements of the same known
/// displacement (tracking units).
pub fn calibrate_scale(expected_distance_mm: f64, measured_units: &[f64]) -> Result<ScaleRecord> {
    if !expected_distance_mm.is_finite() || expected_distance_mm <= 0.0 {
        bail!("Expected test distance must be positive, got {}", expected_distance_mm);
    }
    if measured_units.is_empty() {
        bail!("No displacement measurements");
    }
    if measured_units.iter().any(|m| !m.is_finite() || *m <= 0.0) {
        bail!("Displacement measurements must be positive and finite");
    }

    let mean = measured_units.iter().sum::<f64>() / measured_units.len() as f64;
    let scale_factor = expected_distance_mm / mean;
    let error_percent = measured_units
        .iter()
        .map(|m| ((m * scale_factor - expected_distance_mm).abs() / expected_distance_mm) * 100.0)
        .fold(0.0, f64::max);

    let record = ScaleRecord {
        scale_factor,
        calibrated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        expected_distance_mm,
        measured_distance_units: mean,
        computed_distance_mm: mean * scale_factor,
        error_percent,
    };

    if record.is_accepted() {
        info!(
            "Scale calibration: factor {:.4}, error {:.2}%",
            record.scale_factor, record.error_percent
        );
    } else {
        warn!(
            "Scale calibration error {:.2}% exceeds {}%, consider repeating it",
            record.error_percent, MAX_ACCEPTED_ERROR_PERCENT
        );
    }
    Ok(record)
}

/// Distance between two marker positions, as measured for a scale repeat.
pub fn displacement(start: &Vector3<f64>, end: &Vector3<f64>) -> f64 {
    (end - start).norm()
}
