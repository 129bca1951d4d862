//! Reprojection check of per-marker pose estimates.
//!
//! The detector's own RMS is not trusted: the four marker corners are pushed
//! through the candidate pose and the full camera model, and compared with the
//! observed corners.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NavError;
use crate::geometry::{marker_corners, CameraModel, CameraRig};

use super::observation::{MarkerObservation, ValidatedObservation};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum accepted reprojection RMS (px) at the reference width.
    pub max_rms_px: f64,
    /// Image width the threshold is expressed for.
    pub reference_width_px: u32,
    /// Scale the threshold linearly with the observing camera's width.
    pub scale_with_width: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_rms_px: 2.0,
            reference_width_px: 640,
            scale_with_width: true,
        }
    }
}

pub struct PoseValidator {
    config: ValidatorConfig,
    marker_edge: f64,
}

impl PoseValidator {
    pub fn new(config: ValidatorConfig, marker_edge: f64) -> Self {
        Self {
            config,
            marker_edge,
        }
    }

    pub fn marker_edge(&self) -> f64 {
        self.marker_edge
    }

    /// Acceptance threshold for an image of the given width.
    pub fn threshold_for_width(&self, width_px: u32) -> f64 {
        if !self.config.scale_with_width || self.config.reference_width_px == 0 || width_px == 0 {
            return self.config.max_rms_px;
        }
        self.config.max_rms_px * width_px as f64 / self.config.reference_width_px as f64
    }

    /// RMS pixel distance between the projected and observed corners.
    /// Infinite when a corner projects behind the camera.
    pub fn reprojection_rms(&self, obs: &MarkerObservation, camera: &CameraModel) -> f64 {
        let mut sum_sq = 0.0;
        for (corner, observed) in marker_corners(self.marker_edge).iter().zip(obs.corners.iter()) {
            let p_cam = obs.t_cam_marker.transform_point(corner);
            match camera.project(&p_cam) {
                Some(px) => sum_sq += (px - observed).norm_squared(),
                None => return f64::INFINITY,
            }
        }
        (sum_sq / 4.0).sqrt()
    }

    /// Validate one observation against the camera that produced it.
    pub fn validate(
        &self,
        obs: &MarkerObservation,
        rig: &CameraRig,
    ) -> Result<ValidatedObservation, NavError> {
        let (rms_px, threshold_px) = match rig.camera(obs.camera_id) {
            Some(cam) => (
                self.reprojection_rms(obs, &cam.model),
                self.threshold_for_width(cam.model.width),
            ),
            None => (f64::INFINITY, self.config.max_rms_px),
        };

        if rms_px.is_nan() || rms_px > threshold_px {
            return Err(NavError::ValidationRejected {
                marker_id: obs.marker_id,
                rms_px,
                threshold_px,
            });
        }
        Ok(ValidatedObservation::new(obs.clone(), rms_px))
    }

    /// Validate a batch, returning accepted observations and the rejections.
    pub fn filter(
        &self,
        observations: &[MarkerObservation],
        rig: &CameraRig,
    ) -> (Vec<ValidatedObservation>, Vec<NavError>) {
        let mut accepted = Vec::with_capacity(observations.len());
        let mut rejected = Vec::new();
        for obs in observations {
            match self.validate(obs, rig) {
                Ok(v) => accepted.push(v),
                Err(e) => {
                    debug!("{}", e);
                    rejected.push(e);
                }
            }
        }
        (accepted, rejected)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::SE3;
    use nalgebra::{Vector2, Vector3};

    pub(crate) fn test_camera() -> CameraModel {
        CameraModel::pinhole(800.0, 800.0, 320.0, 240.0, 640, 480)
    }

    /// Observation whose corners are the exact projection of `t_cam_marker`.
    pub(crate) fn perfect_observation(
        marker_id: u32,
        camera: &CameraModel,
        edge: f64,
        t_cam_marker: SE3,
    ) -> MarkerObservation {
        let corners = marker_corners(edge);
        let mut px = [Vector2::zeros(); 4];
        for (i, c) in corners.iter().enumerate() {
            px[i] = camera.project(&t_cam_marker.transform_point(c)).unwrap();
        }
        MarkerObservation {
            marker_id,
            camera_id: 0,
            corners: px,
            t_cam_marker,
            reported_rms_px: 0.0,
        }
    }

    fn facing_pose(z: f64) -> SE3 {
        SE3::from_rvec_tvec(Vector3::new(0.1, -0.05, 0.02), Vector3::new(5.0, -3.0, z))
    }

    #[test]
    fn test_exact_projection_accepted_with_zero_rms() {
        let cam = test_camera();
        let rig = CameraRig::single(0, cam);
        let validator = PoseValidator::new(ValidatorConfig::default(), 30.0);
        let obs = perfect_observation(4, &cam, 30.0, facing_pose(300.0));

        let v = validator.validate(&obs, &rig).unwrap();
        assert!(v.rms_px() < 1e-9);
        assert_eq!(v.marker_id(), 4);
    }

    #[test]
    fn test_shifted_corners_give_shift_as_rms() {
        let cam = test_camera();
        let validator = PoseValidator::new(ValidatorConfig::default(), 30.0);
        let mut obs = perfect_observation(4, &cam, 30.0, facing_pose(300.0));
        for c in obs.corners.iter_mut() {
            c.x += 3.0;
        }
        let rms = validator.reprojection_rms(&obs, &cam);
        assert!((rms - 3.0).abs() < 1e-9);

        let rig = CameraRig::single(0, cam);
        match validator.validate(&obs, &rig) {
            Err(NavError::ValidationRejected {
                marker_id,
                threshold_px,
                ..
            }) => {
                assert_eq!(marker_id, 4);
                assert!((threshold_px - 2.0).abs() < 1e-12);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_threshold_scales_with_width() {
        let validator = PoseValidator::new(ValidatorConfig::default(), 30.0);
        assert!((validator.threshold_for_width(640) - 2.0).abs() < 1e-12);
        assert!((validator.threshold_for_width(1280) - 4.0).abs() < 1e-12);

        let fixed = PoseValidator::new(
            ValidatorConfig {
                scale_with_width: false,
                ..Default::default()
            },
            30.0,
        );
        assert!((fixed.threshold_for_width(1280) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_camera_and_behind_camera_rejected() {
        let cam = test_camera();
        let rig = CameraRig::single(0, cam);
        let validator = PoseValidator::new(ValidatorConfig::default(), 30.0);

        let mut obs = perfect_observation(1, &cam, 30.0, facing_pose(300.0));
        obs.camera_id = 9;
        assert!(validator.validate(&obs, &rig).is_err());

        let mut behind = perfect_observation(1, &cam, 30.0, facing_pose(300.0));
        behind.t_cam_marker.translation.z = -300.0;
        assert!(validator.reprojection_rms(&behind, &cam).is_infinite());
        assert!(validator.validate(&behind, &rig).is_err());
    }

    #[test]
    fn test_filter_splits_batch() {
        let cam = test_camera();
        let rig = CameraRig::single(0, cam);
        let validator = PoseValidator::new(ValidatorConfig::default(), 30.0);

        let good = perfect_observation(1, &cam, 30.0, facing_pose(300.0));
        let mut bad = perfect_observation(2, &cam, 30.0, facing_pose(320.0));
        bad.corners[0].y += 20.0;

        let (accepted, rejected) = validator.filter(&[good, bad], &rig);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].marker_id(), 1);
        assert_eq!(rejected.len(), 1);
    }
}
