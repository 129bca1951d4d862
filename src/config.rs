//! Navigation configuration, loaded from YAML.
//!
//! Every section has defaults, so a partial file (or none at all) works:
//!
//! ```yaml
//! marker_edge_mm: 30.0
//! cameras:
//!   - id: 0
//!     intrinsics: [800.0, 800.0, 320.0, 240.0]
//!     distortion: [0.0, 0.0, 0.0, 0.0, 0.0]
//!     resolution: [640, 480]
//!     T_rig_cam:
//!       data: [1, 0, 0, 0,  0, 1, 0, 0,  0, 0, 1, 0,  0, 0, 0, 1]
//! reference_body:
//!   model_path: models/reference.json
//! tool_body:
//!   marker_ids: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
//! smoothing:
//!   alpha: 0.3
//! publisher:
//!   host: 127.0.0.1
//!   port: 18944
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::calibration::{PivotConfig, RigidBodyCalibrationConfig};
use crate::geometry::{CameraModel, CameraRig, RigCamera, SE3};
use crate::model::BodyModel;
use crate::publish::PublisherConfig;
use crate::tracking::{FusionConfig, SmootherConfig, ValidatorConfig};

/// Row-major 4×4 transform, the same `data:` layout as the EuRoC sensor files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformYaml {
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraYaml {
    pub id: u32,
    /// [fx, fy, cx, cy]
    pub intrinsics: Vec<f64>,
    /// [k1, k2, p1, p2, k3]
    #[serde(default)]
    pub distortion: Vec<f64>,
    /// [width, height]
    pub resolution: [u32; 2],
    /// Identity when omitted.
    #[serde(rename = "T_rig_cam", default)]
    pub t_rig_cam: Option<TransformYaml>,
}

impl CameraYaml {
    fn to_rig_camera(&self) -> Result<RigCamera> {
        if self.intrinsics.len() != 4 {
            bail!(
                "Camera {}: expected 4 intrinsics [fx, fy, cx, cy], got {}",
                self.id,
                self.intrinsics.len()
            );
        }
        if self.distortion.len() > 5 {
            bail!(
                "Camera {}: expected at most 5 distortion coefficients, got {}",
                self.id,
                self.distortion.len()
            );
        }
        let mut distortion = [0.0; 5];
        distortion[..self.distortion.len()].copy_from_slice(&self.distortion);

        let [width, height] = self.resolution;
        let mut model = CameraModel::pinhole(
            self.intrinsics[0],
            self.intrinsics[1],
            self.intrinsics[2],
            self.intrinsics[3],
            width,
            height,
        );
        model.distortion = distortion;

        let t_rig_cam = match &self.t_rig_cam {
            Some(t) => SE3::try_from_row_slice(&t.data)
                .with_context(|| format!("Camera {}: invalid T_rig_cam", self.id))?,
            None => SE3::identity(),
        };

        Ok(RigCamera {
            id: self.id,
            model,
            t_rig_cam,
        })
    }
}

impl Default for CameraYaml {
    fn default() -> Self {
        Self {
            id: 0,
            intrinsics: vec![800.0, 800.0, 320.0, 240.0],
            distortion: Vec::new(),
            resolution: [640, 480],
            t_rig_cam: None,
        }
    }
}

/// Where a tracked body's model comes from.
///
/// A model file wins; otherwise a design-time model is built from the listed
/// marker ids (one id: a single flat marker, twelve: a dodecahedron).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    pub name: String,
    pub model_path: Option<PathBuf>,
    pub marker_ids: Vec<u32>,
    /// Centre-to-face distance of the dodecahedron, tracking units.
    pub inradius: f64,
}

impl BodyConfig {
    pub fn build_model(&self) -> Result<BodyModel> {
        if let Some(path) = &self.model_path {
            return BodyModel::load(path);
        }
        match self.marker_ids.as_slice() {
            [id] => Ok(BodyModel::single_marker(self.name.clone(), *id)),
            ids if ids.len() == 12 && ids.windows(2).all(|w| w[1] == w[0] + 1) => Ok(
                BodyModel::dodecahedron(self.name.clone(), ids[0], self.inradius),
            ),
            ids => bail!(
                "Body '{}': no model file and {} marker ids (expected 1, or 12 consecutive)",
                self.name,
                ids.len()
            ),
        }
    }
}

/// Transform stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub ref_to_tool_channel: String,
    pub ct_to_tool_channel: String,
    #[serde(flatten)]
    pub connection: PublisherConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ref_to_tool_channel: "REF_TO_TOOL".to_string(),
            ct_to_tool_channel: "CT_TO_TOOL".to_string(),
            connection: PublisherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub cameras: Vec<CameraYaml>,
    pub marker_edge_mm: f64,
    pub validation: ValidatorConfig,
    pub fusion: FusionConfig,
    pub reference_body: BodyConfig,
    pub tool_body: BodyConfig,
    pub smoothing: SmootherConfig,
    pub publisher: PublishConfig,
    pub calibration: RigidBodyCalibrationConfig,
    pub pivot: PivotConfig,
    /// JSON file holding a row-major 4×4 `T_ct_ref`.
    pub registration_path: Option<PathBuf>,
    /// JSON scale record; tracking units are taken as mm when absent.
    pub scale_record_path: Option<PathBuf>,
    /// JSON tip offset `[x, y, z]` from a pivot calibration.
    pub tip_offset_path: Option<PathBuf>,
    pub log_csv: Option<PathBuf>,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            cameras: vec![CameraYaml::default()],
            marker_edge_mm: 30.0,
            validation: ValidatorConfig::default(),
            fusion: FusionConfig::default(),
            reference_body: BodyConfig {
                name: "reference".to_string(),
                marker_ids: vec![0],
                ..Default::default()
            },
            tool_body: BodyConfig {
                name: "tool".to_string(),
                marker_ids: (1..=12).collect(),
                inradius: 40.0,
                ..Default::default()
            },
            smoothing: SmootherConfig::default(),
            publisher: PublishConfig::default(),
            calibration: RigidBodyCalibrationConfig::default(),
            pivot: PivotConfig::default(),
            registration_path: None,
            scale_record_path: None,
            tip_offset_path: None,
            log_csv: None,
        }
    }
}

impl NavConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = serde_yaml::from_reader(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )
        .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn camera_rig(&self) -> Result<CameraRig> {
        if self.cameras.is_empty() {
            bail!("No cameras configured");
        }
        let cameras = self
            .cameras
            .iter()
            .map(CameraYaml::to_rig_camera)
            .collect::<Result<Vec<_>>>()?;
        Ok(CameraRig::new(cameras))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = NavConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_relative_eq!(config.validation.max_rms_px, 2.0);
        assert_eq!(config.publisher.connection.port, 18944);
        assert_eq!(config.publisher.ref_to_tool_channel, "REF_TO_TOOL");

        let reference = config.reference_body.build_model().unwrap();
        assert_eq!(reference.len(), 1);
        let tool = config.tool_body.build_model().unwrap();
        assert_eq!(tool.len(), 12);
        assert_eq!(tool.first_marker_id(), Some(1));
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
marker_edge_mm: 20.0
cameras:
  - id: 0
    intrinsics: [600.0, 600.0, 640.0, 360.0]
    distortion: [0.1, -0.05]
    resolution: [1280, 720]
  - id: 1
    intrinsics: [600.0, 600.0, 640.0, 360.0]
    resolution: [1280, 720]
    T_rig_cam:
      data: [1, 0, 0, 100,  0, 1, 0, 0,  0, 0, 1, 0,  0, 0, 0, 1]
smoothing:
  alpha: 0.5
publisher:
  enabled: false
  port: 19000
"#;
        let config = NavConfig::from_yaml_str(yaml).unwrap();
        assert_relative_eq!(config.marker_edge_mm, 20.0);
        assert_relative_eq!(config.smoothing.alpha, 0.5);
        assert_eq!(config.smoothing.max_gap_frames, SmootherConfig::default().max_gap_frames);
        assert!(!config.publisher.enabled);
        assert_eq!(config.publisher.connection.port, 19000);
        assert_eq!(config.publisher.connection.host, "127.0.0.1");

        let rig = config.camera_rig().unwrap();
        assert_eq!(rig.cameras().len(), 2);
        let cam0 = rig.camera(0).unwrap();
        assert_relative_eq!(cam0.model.distortion[0], 0.1);
        assert_relative_eq!(cam0.model.distortion[4], 0.0);
        assert_eq!(cam0.model.width, 1280);
        let cam1 = rig.camera(1).unwrap();
        assert_relative_eq!(cam1.t_rig_cam.translation.x, 100.0);
    }

    #[test]
    fn test_bad_camera_rejected() {
        let yaml = r#"
cameras:
  - id: 0
    intrinsics: [600.0, 600.0, 640.0]
    resolution: [1280, 720]
"#;
        let config = NavConfig::from_yaml_str(yaml).unwrap();
        assert!(config.camera_rig().is_err());
    }

    #[test]
    fn test_body_without_usable_ids_rejected() {
        let body = BodyConfig {
            name: "odd".to_string(),
            marker_ids: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(body.build_model().is_err());
    }
}
