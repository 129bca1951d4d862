//! Tracking of one rigid body across frames.

use tracing::debug;

use crate::error::NavError;
use crate::geometry::CameraRig;
use crate::model::BodyModelHandle;

use super::fusion::{BodyPoseFusion, FusedPose, FusionConfig};
use super::observation::ValidatedObservation;

/// Visibility of a body, advanced once per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackingState {
    /// Not fused since start or the last reset.
    #[default]
    NotInitialized,
    Ok,
    /// Missed for at most the gap limit; smoothed output is still held.
    RecentlyLost,
    Lost,
}

impl TrackingState {
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Outcome of tracking one body for one frame.
#[derive(Debug)]
pub struct BodyTrackingResult {
    pub state: TrackingState,
    pub pose: Option<FusedPose>,
    /// Why no pose was produced, when it wasn't.
    pub error: Option<NavError>,
}

/// Fusion plus visibility bookkeeping for one body.
///
/// The body model is read from the shared handle once per frame, so a model
/// swapped in by a calibration takes effect on the next frame.
pub struct BodyTracker {
    model: BodyModelHandle,
    fusion: BodyPoseFusion,
    state: TrackingState,
    missed_frames: usize,
    max_gap_frames: usize,
}

impl BodyTracker {
    pub fn new(model: BodyModelHandle, config: FusionConfig, max_gap_frames: usize) -> Self {
        Self {
            model,
            fusion: BodyPoseFusion::new(config),
            state: TrackingState::NotInitialized,
            missed_frames: 0,
            max_gap_frames,
        }
    }

    pub fn model(&self) -> &BodyModelHandle {
        &self.model
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn track(
        &mut self,
        observations: &[ValidatedObservation],
        rig: &CameraRig,
    ) -> BodyTrackingResult {
        let model = self.model.load();
        match self.fusion.fuse(observations, &model, rig) {
            Ok(pose) => {
                self.state = TrackingState::Ok;
                self.missed_frames = 0;
                BodyTrackingResult {
                    state: self.state,
                    pose: Some(pose),
                    error: None,
                }
            }
            Err(e) => {
                self.on_missing();
                debug!("Body '{}' not tracked: {}", model.name, e);
                BodyTrackingResult {
                    state: self.state,
                    pose: None,
                    error: Some(e),
                }
            }
        }
    }

    fn on_missing(&mut self) {
        if self.state == TrackingState::NotInitialized {
            return;
        }
        self.missed_frames += 1;
        if self.missed_frames > self.max_gap_frames {
            if self.state != TrackingState::Lost {
                // Quaternion continuity is meaningless across a long gap
                self.fusion.reset();
            }
            self.state = TrackingState::Lost;
        } else {
            self.state = TrackingState::RecentlyLost;
        }
    }

    pub fn reset(&mut self) {
        self.fusion.reset();
        self.state = TrackingState::NotInitialized;
        self.missed_frames = 0;
    }
}
