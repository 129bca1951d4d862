//! Marker detector seam.
//!
//! Detection and per-marker pose solving happen outside this crate; anything
//! that can turn a captured frame into marker observations plugs in here.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::io::recording::load_recording;

use super::observation::{DetectionFrame, MarkerObservation};

pub trait MarkerDetector {
    /// Whatever the detector consumes (an image, a frame index, ...).
    type Frame;

    /// Zero or more marker observations for one camera frame.
    fn detect(&mut self, frame: &Self::Frame) -> Result<Vec<MarkerObservation>>;

    /// Detect and wrap the result as a [`DetectionFrame`].
    fn detect_frame(
        &mut self,
        frame: &Self::Frame,
        frame_index: u64,
        timestamp_ns: u64,
    ) -> Result<DetectionFrame> {
        Ok(DetectionFrame::new(frame_index, timestamp_ns, self.detect(frame)?))
    }
}

/// Replays a recorded session; frames are addressed by frame index.
#[derive(Debug, Clone, Default)]
pub struct RecordedDetector {
    frames: BTreeMap<u64, DetectionFrame>,
}

impl RecordedDetector {
    pub fn new(frames: Vec<DetectionFrame>) -> Self {
        Self {
            frames: frames.into_iter().map(|f| (f.frame_index, f)).collect(),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(load_recording(path)?))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Recorded frames in index order.
    pub fn frames(&self) -> impl Iterator<Item = &DetectionFrame> {
        self.frames.values()
    }
}

impl MarkerDetector for RecordedDetector {
    type Frame = u64;

    fn detect(&mut self, frame: &u64) -> Result<Vec<MarkerObservation>> {
        Ok(self
            .frames
            .get(frame)
            .map(|f| f.observations.clone())
            .unwrap_or_default())
    }

    fn detect_frame(
        &mut self,
        frame: &u64,
        frame_index: u64,
        timestamp_ns: u64,
    ) -> Result<DetectionFrame> {
        // Keep the recorded timestamp when there is one
        let timestamp_ns = self
            .frames
            .get(frame)
            .map(|f| f.timestamp_ns)
            .unwrap_or(timestamp_ns);
        Ok(DetectionFrame::new(frame_index, timestamp_ns, self.detect(frame)?))
    }
}
