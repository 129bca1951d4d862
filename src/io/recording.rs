//! Recorded detector sessions (CSV).
//!
//! One row per marker observation:
//!
//! ```text
//! frame,timestamp_ns,camera_id,marker_id,c0x,c0y,c1x,c1y,c2x,c2y,c3x,c3y,rx,ry,rz,tx,ty,tz,rms_px
//! ```
//!
//! Corners are in top-left, top-right, bottom-right, bottom-left order and the
//! marker rotation is a Rodrigues vector. Lines starting with `#` and a header
//! row are ignored.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;
use crate::tracking::{DetectionFrame, MarkerObservation};

const HEADER: [&str; 19] = [
    "frame", "timestamp_ns", "camera_id", "marker_id", "c0x", "c0y", "c1x", "c1y", "c2x", "c2y",
    "c3x", "c3y", "rx", "ry", "rz", "tx", "ty", "tz", "rms_px",
];

pub fn load_recording<P: AsRef<Path>>(path: P) -> Result<Vec<DetectionFrame>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open recording {}", path.display()))?;
    read_recording(file).with_context(|| format!("In recording {}", path.display()))
}

/// Parse a recording, grouping rows into frames ordered by frame index.
pub fn read_recording<R: Read>(reader: R) -> Result<Vec<DetectionFrame>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut frames: BTreeMap<u64, DetectionFrame> = BTreeMap::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.get(0) == Some(HEADER[0]) {
            continue;
        }
        if rec.len() < HEADER.len() {
            bail!(
                "Row {} has {} fields, expected {}",
                line + 1,
                rec.len(),
                HEADER.len()
            );
        }
        let (frame_index, timestamp_ns, obs) =
            parse_row(&rec).with_context(|| format!("Malformed row {}", line + 1))?;

        frames
            .entry(frame_index)
            .or_insert_with(|| DetectionFrame::new(frame_index, timestamp_ns, Vec::new()))
            .observations
            .push(obs);
    }
    Ok(frames.into_values().collect())
}

fn parse_row(rec: &StringRecord) -> Result<(u64, u64, MarkerObservation)> {
    let f = |i: usize| -> Result<f64> { Ok(rec[i].parse()?) };

    let frame_index: u64 = rec[0].parse()?;
    let timestamp_ns: u64 = rec[1].parse()?;
    let camera_id: u32 = rec[2].parse()?;
    let marker_id: u32 = rec[3].parse()?;

    let mut corners = [Vector2::zeros(); 4];
    for (k, corner) in corners.iter_mut().enumerate() {
        *corner = Vector2::new(f(4 + 2 * k)?, f(5 + 2 * k)?);
    }
    let rvec = Vector3::new(f(12)?, f(13)?, f(14)?);
    let tvec = Vector3::new(f(15)?, f(16)?, f(17)?);

    Ok((
        frame_index,
        timestamp_ns,
        MarkerObservation {
            marker_id,
            camera_id,
            corners,
            t_cam_marker: SE3::from_rvec_tvec(rvec, tvec),
            reported_rms_px: f(18)?,
        },
    ))
}

/// Write frames in the recording format (with header row).
pub fn write_recording<W: Write>(writer: W, frames: &[DetectionFrame]) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record(HEADER)?;

    for frame in frames {
        for obs in &frame.observations {
            let rvec = obs.t_cam_marker.rotation.scaled_axis();
            let t = &obs.t_cam_marker.translation;
            let mut row = vec![
                frame.frame_index.to_string(),
                frame.timestamp_ns.to_string(),
                obs.camera_id.to_string(),
                obs.marker_id.to_string(),
            ];
            for c in &obs.corners {
                row.push(c.x.to_string());
                row.push(c.y.to_string());
            }
            for v in [rvec.x, rvec.y, rvec.z, t.x, t.y, t.z, obs.reported_rms_px] {
                row.push(v.to_string());
            }
            wtr.write_record(&row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn save_recording<P: AsRef<Path>>(path: P, frames: &[DetectionFrame]) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create recording {}", path.display()))?;
    write_recording(file, frames)
}
