//! Small JSON calibration artefacts: the CT registration and the tip offset.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Either a flat row-major list of 16 values or four rows of four.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MatrixJson {
    Flat(Vec<f64>),
    Rows(Vec<Vec<f64>>),
}

/// Load a registration `T_ct_ref` stored as a row-major 4×4 matrix.
pub fn load_registration<P: AsRef<Path>>(path: P) -> Result<SE3> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read registration {}", path.display()))?;
    let matrix: MatrixJson = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse registration {}", path.display()))?;
    let values = match matrix {
        MatrixJson::Flat(v) => v,
        MatrixJson::Rows(rows) => rows.into_iter().flatten().collect(),
    };
    SE3::try_from_row_slice(&values)
        .with_context(|| format!("Invalid registration in {}", path.display()))
}

pub fn save_registration<P: AsRef<Path>>(path: P, t_ct_ref: &SE3) -> Result<()> {
    let path = path.as_ref();
    let rows: Vec<Vec<f64>> = t_ct_ref
        .to_row_vec()
        .chunks(4)
        .map(|r| r.to_vec())
        .collect();
    fs::write(path, serde_json::to_string_pretty(&rows)?)
        .with_context(|| format!("Failed to write registration {}", path.display()))
}

#[derive(Debug, Serialize, Deserialize)]
struct TipOffsetJson {
    tip_offset: [f64; 3],
    #[serde(default)]
    residual_rms: Option<f64>,
}

/// Load a tip offset (instrument-body coordinates, tracking units).
pub fn load_tip_offset<P: AsRef<Path>>(path: P) -> Result<Vector3<f64>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tip offset {}", path.display()))?;
    let tip: TipOffsetJson = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse tip offset {}", path.display()))?;
    Ok(Vector3::from(tip.tip_offset))
}

pub fn save_tip_offset<P: AsRef<Path>>(
    path: P,
    tip_offset: &Vector3<f64>,
    residual_rms: f64,
) -> Result<()> {
    let path = path.as_ref();
    let tip = TipOffsetJson {
        tip_offset: [tip_offset.x, tip_offset.y, tip_offset.z],
        residual_rms: Some(residual_rms),
    };
    fs::write(path, serde_json::to_string_pretty(&tip)?)
        .with_context(|| format!("Failed to write tip offset {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_registration_nested_and_flat() {
        let path = temp_path("registration_nested");
        fs::write(
            &path,
            "[[0, -1, 0, 10], [1, 0, 0, 20], [0, 0, 1, 30], [0, 0, 0, 1]]",
        )
        .unwrap();
        let t = load_registration(&path).unwrap();
        assert_relative_eq!(t.translation, Vector3::new(10.0, 20.0, 30.0), epsilon = 1e-12);
        assert_relative_eq!(
            t.transform_point(&Vector3::new(1.0, 0.0, 0.0)),
            Vector3::new(10.0, 21.0, 30.0),
            epsilon = 1e-12
        );

        fs::write(&path, "[1,0,0,5, 0,1,0,0, 0,0,1,0, 0,0,0,1]").unwrap();
        let flat = load_registration(&path).unwrap();
        assert_relative_eq!(flat.translation.x, 5.0);

        save_registration(&path, &t).unwrap();
        let back = load_registration(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_registration_bad_bottom_row() {
        let path = temp_path("registration_bad");
        fs::write(&path, "[1,0,0,0, 0,1,0,0, 0,0,1,0, 1,0,0,1]").unwrap();
        let result = load_registration(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_tip_offset_round_trip() {
        let path = temp_path("tip_offset");
        save_tip_offset(&path, &Vector3::new(0.0, 0.0, 50.0), 0.2).unwrap();
        let tip = load_tip_offset(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_relative_eq!(tip, Vector3::new(0.0, 0.0, 50.0));
    }
}
