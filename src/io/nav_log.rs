//! Per-frame navigation log (CSV) for offline accuracy analysis.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;

/// One logged frame. Absent values are written as empty fields.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NavLogRecord {
    /// Wall-clock time the row was written.
    pub timestamp: String,
    /// Capture time of the frame, from the detector.
    pub timestamp_ns: u64,
    pub frame: u64,
    pub reference_visible: bool,
    pub reference_confidence: Option<f64>,
    pub reference_x: Option<f64>,
    pub reference_y: Option<f64>,
    pub reference_z: Option<f64>,
    pub tool_visible: bool,
    pub tool_confidence: Option<f64>,
    pub tool_markers: String,
    pub tool_x: Option<f64>,
    pub tool_y: Option<f64>,
    pub tool_z: Option<f64>,
    pub relative_x_mm: Option<f64>,
    pub relative_y_mm: Option<f64>,
    pub relative_z_mm: Option<f64>,
    pub distance_mm: Option<f64>,
    pub tip_x_mm: Option<f64>,
    pub tip_y_mm: Option<f64>,
    pub tip_z_mm: Option<f64>,
}

pub struct NavLogWriter {
    writer: Writer<File>,
}

impl NavLogWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let writer = Writer::from_path(path)
            .with_context(|| format!("Failed to create navigation log {}", path.display()))?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, record: &NavLogRecord) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
