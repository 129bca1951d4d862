//! Per-marker detector output and the validated form the pipeline consumes.

use nalgebra::Vector2;

use crate::geometry::SE3;

/// One marker pose estimate reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerObservation {
    pub marker_id: u32,
    pub camera_id: u32,
    /// Observed pixel corners: top-left, top-right, bottom-right, bottom-left.
    pub corners: [Vector2<f64>; 4],
    /// Pose of the marker in the observing camera (T_cam_marker).
    pub t_cam_marker: SE3,
    /// Reprojection RMS reported by the detector (px).
    pub reported_rms_px: f64,
}

/// An observation that passed reprojection validation.
///
/// Only [`crate::tracking::PoseValidator`] constructs these, so fusion and
/// calibration can rely on every input having been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedObservation {
    observation: MarkerObservation,
    rms_px: f64,
}

impl ValidatedObservation {
    pub(crate) fn new(observation: MarkerObservation, rms_px: f64) -> Self {
        Self { observation, rms_px }
    }

    pub fn observation(&self) -> &MarkerObservation {
        &self.observation
    }

    pub fn marker_id(&self) -> u32 {
        self.observation.marker_id
    }

    pub fn camera_id(&self) -> u32 {
        self.observation.camera_id
    }

    pub fn corners(&self) -> &[Vector2<f64>; 4] {
        &self.observation.corners
    }

    pub fn t_cam_marker(&self) -> &SE3 {
        &self.observation.t_cam_marker
    }

    /// RMS recomputed by the validator (px).
    pub fn rms_px(&self) -> f64 {
        self.rms_px
    }
}

/// Every observation of one capture instant, across all cameras.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionFrame {
    pub frame_index: u64,
    pub timestamp_ns: u64,
    pub observations: Vec<MarkerObservation>,
}

impl DetectionFrame {
    pub fn new(frame_index: u64, timestamp_ns: u64, observations: Vec<MarkerObservation>) -> Self {
        Self {
            frame_index,
            timestamp_ns,
            observations,
        }
    }
}
