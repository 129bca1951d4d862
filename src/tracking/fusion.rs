//! Multi-marker fusion of one rigid body's pose.
//!
//! Every validated marker of the body yields a candidate body pose
//!
//! ```text
//! T_rig_body_i = T_rig_cam ∘ T_cam_marker_i ∘ inverse(T_body_marker_i)
//! ```
//!
//! Candidates are blended with weights `w_i = 1 / (rms_i² + ε)`: translations
//! by weighted mean, rotations by the hemisphere-aligned linear quaternion
//! average from [`crate::geometry::so3`]. The hemisphere reference is the
//! previous frame's fused rotation, so the output quaternion never flips sign
//! between frames.

use std::collections::BTreeMap;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NavError;
use crate::geometry::so3::weighted_quaternion_mean;
use crate::geometry::{CameraRig, SE3};
use crate::model::BodyModel;

use super::observation::ValidatedObservation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Regularizer in the inverse-squared-error weight.
    pub epsilon: f64,
    /// Candidate spread (deg) above which the linear rotation average is
    /// reported as unreliable.
    pub spread_warning_deg: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            spread_warning_deg: 15.0,
        }
    }
}

/// Fused pose of one body for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPose {
    pub t_rig_body: SE3,
    /// `(n/(n+1)) · (W/(W+1))`, in [0, 1).
    pub confidence: f64,
    pub marker_count: usize,
    pub total_weight: f64,
    /// Largest angle (deg) between a candidate rotation and the fused one.
    pub rotation_spread_deg: f64,
    pub marker_ids: Vec<u32>,
}

/// Weighted candidate body pose.
#[derive(Debug, Clone, Copy)]
pub struct PoseCandidate {
    pub marker_id: u32,
    pub t_rig_body: SE3,
    pub weight: f64,
}

pub struct BodyPoseFusion {
    config: FusionConfig,
    /// Hemisphere reference for the next frame.
    prev_rotation: Option<UnitQuaternion<f64>>,
}

impl BodyPoseFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            prev_rotation: None,
        }
    }

    /// Build the weighted candidates of the observations that belong to
    /// `model` and come from a camera of `rig`.
    pub fn candidates(
        &self,
        observations: &[ValidatedObservation],
        model: &BodyModel,
        rig: &CameraRig,
    ) -> Vec<PoseCandidate> {
        pose_candidates(observations, model.markers(), rig, self.config.epsilon)
    }

    /// Fuse the body pose for this frame and remember its rotation as the
    /// next hemisphere reference.
    pub fn fuse(
        &mut self,
        observations: &[ValidatedObservation],
        model: &BodyModel,
        rig: &CameraRig,
    ) -> Result<FusedPose, NavError> {
        let candidates = self.candidates(observations, model, rig);
        let fused = fuse_candidates(&candidates, self.prev_rotation.as_ref()).ok_or_else(|| {
            NavError::InsufficientObservations {
                body: model.name.clone(),
            }
        })?;

        if fused.rotation_spread_deg > self.config.spread_warning_deg {
            warn!(
                "Body '{}': marker rotations spread {:.1}° (> {:.1}°), linear average is unreliable",
                model.name, fused.rotation_spread_deg, self.config.spread_warning_deg
            );
        }

        self.prev_rotation = Some(fused.t_rig_body.rotation);
        Ok(fused)
    }

    /// Forget the hemisphere reference (after a tracking gap).
    pub fn reset(&mut self) {
        self.prev_rotation = None;
    }
}

/// One body-pose candidate per observation whose marker offset is known,
/// weighted `1 / (rms² + epsilon)`.
pub fn pose_candidates(
    observations: &[ValidatedObservation],
    markers: &BTreeMap<u32, SE3>,
    rig: &CameraRig,
    epsilon: f64,
) -> Vec<PoseCandidate> {
    observations
        .iter()
        .filter_map(|obs| {
            let t_body_marker = markers.get(&obs.marker_id())?;
            let camera = rig.camera(obs.camera_id())?;
            let t_rig_body = camera
                .t_rig_cam
                .compose(obs.t_cam_marker())
                .compose(&t_body_marker.inverse());
            Some(PoseCandidate {
                marker_id: obs.marker_id(),
                t_rig_body,
                weight: 1.0 / (obs.rms_px() * obs.rms_px() + epsilon),
            })
        })
        .collect()
}

/// Stateless weighted fusion of pose candidates.
///
/// `reference` selects the quaternion hemisphere; the first candidate is used
/// when absent. Returns `None` for no candidates or a degenerate weight sum.
pub fn fuse_candidates(
    candidates: &[PoseCandidate],
    reference: Option<&UnitQuaternion<f64>>,
) -> Option<FusedPose> {
    let first = candidates.first()?;
    let total_weight: f64 = candidates.iter().map(|c| c.weight).sum();
    if !total_weight.is_finite() || total_weight <= 0.0 {
        return None;
    }

    let translation = candidates
        .iter()
        .fold(Vector3::zeros(), |acc, c| acc + c.t_rig_body.translation * c.weight)
        / total_weight;

    let reference = reference.copied().unwrap_or(first.t_rig_body.rotation);
    let weighted: Vec<_> = candidates
        .iter()
        .map(|c| (c.t_rig_body.rotation, c.weight))
        .collect();
    let rotation = weighted_quaternion_mean(&weighted, &reference)?;

    let rotation_spread_deg = candidates
        .iter()
        .map(|c| c.t_rig_body.rotation.angle_to(&rotation).to_degrees())
        .fold(0.0, f64::max);

    let n = candidates.len() as f64;
    Some(FusedPose {
        t_rig_body: SE3 {
            rotation,
            translation,
        },
        confidence: (n / (n + 1.0)) * (total_weight / (total_weight + 1.0)),
        marker_count: candidates.len(),
        total_weight,
        rotation_spread_deg,
        marker_ids: candidates.iter().map(|c| c.marker_id).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraModel, RigCamera};
    use crate::tracking::validator::tests::{perfect_observation, test_camera};
    use crate::tracking::validator::{PoseValidator, ValidatorConfig};
    use approx::assert_relative_eq;
    use nalgebra::Unit;
    use std::collections::BTreeMap;

    const EDGE: f64 = 30.0;

    fn two_marker_model() -> BodyModel {
        let mut markers = BTreeMap::new();
        markers.insert(1, SE3::from_rvec_tvec(Vector3::zeros(), Vector3::new(-40.0, 0.0, 0.0)));
        markers.insert(
            2,
            SE3::from_rvec_tvec(Vector3::new(0.0, 0.3, 0.0), Vector3::new(40.0, 0.0, 0.0)),
        );
        BodyModel::new("tool", markers)
    }

    fn observe(
        model: &BodyModel,
        camera: &CameraModel,
        t_cam_body: &SE3,
    ) -> Vec<ValidatedObservation> {
        let validator = PoseValidator::new(ValidatorConfig::default(), EDGE);
        let rig = CameraRig::single(0, *camera);
        model
            .markers()
            .iter()
            .map(|(id, t_body_marker)| {
                let obs = perfect_observation(*id, camera, EDGE, t_cam_body.compose(t_body_marker));
                validator.validate(&obs, &rig).unwrap()
            })
            .collect()
    }

    fn candidate(id: u32, rotation: UnitQuaternion<f64>, t: Vector3<f64>, weight: f64) -> PoseCandidate {
        PoseCandidate {
            marker_id: id,
            t_rig_body: SE3 {
                rotation,
                translation: t,
            },
            weight,
        }
    }

    #[test]
    fn test_consistent_markers_recover_body_pose() {
        let camera = test_camera();
        let model = two_marker_model();
        let t_cam_body = SE3::from_rvec_tvec(Vector3::new(0.2, -0.1, 0.05), Vector3::new(10.0, 5.0, 400.0));
        let observations = observe(&model, &camera, &t_cam_body);

        let mut fusion = BodyPoseFusion::new(FusionConfig::default());
        let fused = fusion
            .fuse(&observations, &model, &CameraRig::single(0, camera))
            .unwrap();

        assert_eq!(fused.marker_count, 2);
        assert_relative_eq!(fused.t_rig_body.translation, t_cam_body.translation, epsilon = 1e-6);
        assert!(fused.t_rig_body.rotation_angle_to(&t_cam_body) < 1e-8);
        assert!(fused.rotation_spread_deg < 1e-6);
    }

    #[test]
    fn test_equal_weights_give_arithmetic_mean() {
        let axis = Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        let c = [
            candidate(1, UnitQuaternion::from_axis_angle(&axis, 0.10), Vector3::new(0.0, 0.0, 0.0), 2.0),
            candidate(2, UnitQuaternion::from_axis_angle(&axis, 0.14), Vector3::new(10.0, 4.0, -2.0), 2.0),
        ];
        let fused = fuse_candidates(&c, None).unwrap();

        assert_relative_eq!(fused.t_rig_body.translation, Vector3::new(5.0, 2.0, -1.0), epsilon = 1e-12);
        assert_relative_eq!(fused.t_rig_body.rotation.angle(), 0.12, epsilon = 1e-9);
        assert_relative_eq!(fused.total_weight, 4.0);
    }

    #[test]
    fn test_quaternion_sign_continuity_across_frames() {
        let axis = Unit::new_normalize(Vector3::new(1.0, 0.0, 1.0));
        let q = UnitQuaternion::from_axis_angle(&axis, 0.5);
        let prev = fuse_candidates(&[candidate(1, q, Vector3::zeros(), 1.0)], None)
            .unwrap()
            .t_rig_body
            .rotation;

        // Same physical rotation reported with the opposite sign
        let flipped = UnitQuaternion::new_unchecked(-q.into_inner());
        let next = fuse_candidates(&[candidate(1, flipped, Vector3::zeros(), 1.0)], Some(&prev))
            .unwrap()
            .t_rig_body
            .rotation;

        assert!(next.quaternion().dot(prev.quaternion()) > 0.0);
        assert!(next.angle_to(&q) < 1e-12);
    }

    #[test]
    fn test_confidence_monotonic_and_bounded() {
        let id = UnitQuaternion::identity();
        let one = fuse_candidates(&[candidate(1, id, Vector3::zeros(), 5.0)], None).unwrap();
        let two = fuse_candidates(
            &[
                candidate(1, id, Vector3::zeros(), 5.0),
                candidate(2, id, Vector3::zeros(), 5.0),
            ],
            None,
        )
        .unwrap();
        let heavy = fuse_candidates(&[candidate(1, id, Vector3::zeros(), 500.0)], None).unwrap();

        assert!(two.confidence > one.confidence);
        assert!(heavy.confidence > one.confidence);
        for c in [one.confidence, two.confidence, heavy.confidence] {
            assert!((0.0..1.0).contains(&c));
        }
        assert_relative_eq!(one.confidence, 0.5 * 5.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_no_usable_observation_is_an_error() {
        let camera = test_camera();
        let model = two_marker_model();
        let mut fusion = BodyPoseFusion::new(FusionConfig::default());

        let err = fusion.fuse(&[], &model, &CameraRig::single(0, camera)).unwrap_err();
        assert!(matches!(err, NavError::InsufficientObservations { .. }));

        // Markers of another body are ignored
        let other = BodyModel::single_marker("reference", 0);
        let observations = observe(&other, &camera, &SE3::from_rvec_tvec(Vector3::zeros(), Vector3::new(0.0, 0.0, 300.0)));
        assert!(fusion.fuse(&observations, &model, &CameraRig::single(0, camera)).is_err());
    }

    #[test]
    fn test_rig_extrinsic_is_applied() {
        let camera = test_camera();
        let model = BodyModel::single_marker("tool", 7);
        let t_cam_body = SE3::from_rvec_tvec(Vector3::new(0.0, 0.1, 0.0), Vector3::new(0.0, 0.0, 350.0));
        let mut observations = observe(&model, &camera, &t_cam_body);
        let obs = observations.remove(0);

        let t_rig_cam = SE3::from_rvec_tvec(Vector3::new(0.0, -0.2, 0.0), Vector3::new(120.0, 0.0, 0.0));
        let rig = CameraRig::new(vec![RigCamera {
            id: 0,
            model: camera,
            t_rig_cam,
        }]);

        let mut fusion = BodyPoseFusion::new(FusionConfig::default());
        let fused = fusion.fuse(&[obs], &model, &rig).unwrap();
        let expected = t_rig_cam.compose(&t_cam_body);

        assert_relative_eq!(fused.t_rig_body.translation, expected.translation, epsilon = 1e-9);
        assert!(fused.t_rig_body.rotation_angle_to(&expected) < 1e-9);
    }

    #[test]
    fn test_validation_then_fusion_keeps_only_accurate_marker() {
        let camera = test_camera();
        let rig = CameraRig::single(0, camera);
        let model = two_marker_model();
        let t_cam_body = SE3::from_rvec_tvec(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.0, 400.0));
        let validator = PoseValidator::new(ValidatorConfig::default(), EDGE);
        let shifted = |id: u32, shift_px: f64| {
            let t_cam_marker = t_cam_body.compose(model.marker(id).unwrap());
            let mut obs = perfect_observation(id, &camera, EDGE, t_cam_marker);
            for c in obs.corners.iter_mut() {
                c.x += shift_px;
            }
            obs
        };
        let mut fusion = BodyPoseFusion::new(FusionConfig::default());

        // 1.0 px passes the 2.0 px threshold, 3.0 px does not
        let (accepted, rejected) = validator.filter(&[shifted(1, 1.0), shifted(2, 3.0)], &rig);
        assert_eq!(accepted.len(), 1);
        assert_relative_eq!(accepted[0].rms_px(), 1.0, epsilon = 1e-9);
        match &rejected[..] {
            [NavError::ValidationRejected { marker_id, rms_px, threshold_px }] => {
                assert_eq!(*marker_id, 2);
                assert_relative_eq!(*rms_px, 3.0, epsilon = 1e-9);
                assert_relative_eq!(*threshold_px, 2.0);
            }
            other => panic!("unexpected rejections {:?}", other),
        }

        let fused = fusion.fuse(&accepted, &model, &rig).unwrap();
        assert_eq!(fused.marker_ids, vec![1]);
        assert_relative_eq!(fused.t_rig_body.translation, t_cam_body.translation, epsilon = 1e-9);
        assert_relative_eq!(fused.total_weight, 1.0 / (1.0 + 1e-3), epsilon = 1e-12);

        let (accepted, rejected) = validator.filter(&[shifted(1, 2.5), shifted(2, 3.0)], &rig);
        assert!(accepted.is_empty());
        assert_eq!(rejected.len(), 2);
        assert!(matches!(
            fusion.fuse(&accepted, &model, &rig),
            Err(NavError::InsufficientObservations { .. })
        ));
    }

    #[test]
    fn test_candidate_weights_follow_epsilon() {
        let camera = test_camera();
        let rig = CameraRig::single(0, camera);
        let model = two_marker_model();
        let t_cam_body = SE3::from_rvec_tvec(Vector3::zeros(), Vector3::new(0.0, 0.0, 400.0));
        let observations = observe(&model, &camera, &t_cam_body);
        let noisy = ValidatedObservation::new(observations[1].observation().clone(), 0.5);

        let candidates = pose_candidates(&[noisy.clone()], model.markers(), &rig, 0.75);
        assert_eq!(candidates.len(), 1);
        assert_relative_eq!(candidates[0].weight, 1.0, epsilon = 1e-12);

        let fusion = BodyPoseFusion::new(FusionConfig {
            epsilon: 0.75,
            ..Default::default()
        });
        let via_fusion = fusion.candidates(&[noisy], &model, &rig);
        assert_relative_eq!(via_fusion[0].weight, candidates[0].weight);
    }

    #[test]
    fn test_reset_clears_hemisphere_reference() {
        let camera = test_camera();
        let model = BodyModel::single_marker("tool", 7);
        let t_cam_body = SE3::from_rvec_tvec(Vector3::zeros(), Vector3::new(0.0, 0.0, 350.0));
        let observations = observe(&model, &camera, &t_cam_body);

        let mut fusion = BodyPoseFusion::new(FusionConfig::default());
        fusion.fuse(&observations, &model, &CameraRig::single(0, camera)).unwrap();
        assert!(fusion.prev_rotation.is_some());
        fusion.reset();
        assert!(fusion.prev_rotation.is_none());
    }
}
