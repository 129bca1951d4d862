//! Navigation system - per-frame orchestration and calibration workflows.
//!
//! `NavigationSystem` owns the synchronous per-frame pipeline
//! (validate → fuse each body → compose → smooth → publish → log) and hosts
//! the offline workflows that feed it: body recalibration, pivot capture and
//! scale / registration loading. The only state shared with other threads is
//! the pair of body model handles and the publisher's sender thread.

use chrono::Local;
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};

use crate::calibration::{
    calibrate_scale, displacement, CalibrationFrame, CalibrationReport, PivotCalibrator,
    PivotResult, RigidBodyCalibrationConfig, RigidBodyCalibrator, ScaleRecord,
};
use crate::config::NavConfig;
use crate::error::NavError;
use crate::geometry::{CameraRig, SE3};
use crate::io::{NavLogRecord, NavLogWriter, load_registration, load_tip_offset};
use crate::model::{BodyModel, BodyModelHandle};
use crate::publish::{ChannelName, TransformPublisher};
use crate::tracking::{
    BodyPoseFusion, BodyTracker, BodyTrackingResult, ComposedTransforms, DetectionFrame,
    FusionConfig, PoseValidator, TemporalSmoother, TransformComposer,
};

/// Which of the two tracked bodies an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedBody {
    Reference,
    Tool,
}

impl TrackedBody {
    pub fn other(self) -> Self {
        match self {
            Self::Reference => Self::Tool,
            Self::Tool => Self::Reference,
        }
    }
}

/// Everything produced for one detection frame.
#[derive(Debug)]
pub struct FrameResult {
    pub frame_index: u64,
    pub timestamp_ns: u64,
    pub accepted_observations: usize,
    /// Observations dropped by reprojection validation.
    pub rejected: Vec<NavError>,
    pub reference: BodyTrackingResult,
    pub tool: BodyTrackingResult,
    /// This frame's unsmoothed output; `None` unless both bodies were fused.
    pub composed: Option<ComposedTransforms>,
    /// Smoothed reference-to-tool transform. On a frame without output this
    /// is the last smoothed value, until the smoother's gap limit resets it.
    pub smoothed_ref_to_tool: Option<SE3>,
    pub smoothed_ct_to_tool: Option<SE3>,
    /// Whether every message of this frame was queued for sending.
    pub published: bool,
}

impl FrameResult {
    pub fn has_output(&self) -> bool {
        self.composed.is_some()
    }
}

struct Channels {
    ref_to_tool: ChannelName,
    ct_to_tool: ChannelName,
}

pub struct NavigationSystem {
    rig: CameraRig,
    validator: PoseValidator,
    reference: BodyTracker,
    tool: BodyTracker,
    composer: TransformComposer,
    ref_smoother: TemporalSmoother,
    ct_smoother: TemporalSmoother,
    publisher: Option<TransformPublisher>,
    channels: Channels,
    log: Option<NavLogWriter>,
    calibration: RigidBodyCalibrationConfig,
    fusion: FusionConfig,
    pivot: PivotCalibrator,
    pivot_capture: bool,
    pivot_samples: Vec<SE3>,
    scale_record: Option<ScaleRecord>,
}

impl NavigationSystem {
    /// Build the system from already loaded parts. Nothing is read from disk;
    /// the publisher is started when the config enables it.
    pub fn new(
        config: &NavConfig,
        rig: CameraRig,
        reference_model: BodyModel,
        tool_model: BodyModel,
    ) -> Result<Self> {
        let channels = Channels {
            ref_to_tool: ChannelName::new(&config.publisher.ref_to_tool_channel)?,
            ct_to_tool: ChannelName::new(&config.publisher.ct_to_tool_channel)?,
        };
        let gap = config.smoothing.max_gap_frames;

        let publisher = if config.publisher.enabled {
            Some(TransformPublisher::spawn(config.publisher.connection.clone()))
        } else {
            None
        };

        info!(
            "Navigation system: {} camera(s), reference '{}' ({} markers), tool '{}' ({} markers)",
            rig.cameras().len(),
            reference_model.name,
            reference_model.len(),
            tool_model.name,
            tool_model.len()
        );

        Ok(Self {
            validator: PoseValidator::new(config.validation.clone(), config.marker_edge_mm),
            reference: BodyTracker::new(
                BodyModelHandle::new(reference_model),
                config.fusion.clone(),
                gap,
            ),
            tool: BodyTracker::new(BodyModelHandle::new(tool_model), config.fusion.clone(), gap),
            composer: TransformComposer::default(),
            ref_smoother: TemporalSmoother::new(&config.smoothing)?,
            ct_smoother: TemporalSmoother::new(&config.smoothing)?,
            publisher,
            channels,
            log: None,
            calibration: config.calibration.clone(),
            fusion: config.fusion.clone(),
            pivot: PivotCalibrator::new(config.pivot.clone()),
            pivot_capture: false,
            pivot_samples: Vec::new(),
            scale_record: None,
            rig,
        })
    }

    /// Build the system and load every calibration artefact the config names.
    pub fn from_config(config: &NavConfig) -> Result<Self> {
        let rig = config.camera_rig()?;
        let reference = config
            .reference_body
            .build_model()
            .context("Failed to build reference body model")?;
        let tool = config
            .tool_body
            .build_model()
            .context("Failed to build tool body model")?;

        let mut system = Self::new(config, rig, reference, tool)?;

        if let Some(path) = &config.registration_path {
            system.set_registration(Some(load_registration(path)?));
        }
        if let Some(path) = &config.scale_record_path {
            system.set_scale_record(ScaleRecord::load(path)?);
        }
        if let Some(path) = &config.tip_offset_path {
            system.set_tip_offset(Some(load_tip_offset(path)?));
        }
        if let Some(path) = &config.log_csv {
            system.log = Some(NavLogWriter::create(path)?);
            info!("Logging navigation frames to {}", path.display());
        }
        Ok(system)
    }

    /// Run the per-frame pipeline. Never fails: a frame without usable
    /// observations produces a result without output.
    pub fn process_frame(&mut self, frame: &DetectionFrame) -> FrameResult {
        let (accepted, rejected) = self.validator.filter(&frame.observations, &self.rig);
        for err in &rejected {
            debug!("Frame {}: {}", frame.frame_index, err);
        }

        let reference = self.reference.track(&accepted, &self.rig);
        let tool = self.tool.track(&accepted, &self.rig);

        let t_rig_ref = reference.pose.as_ref().map(|p| &p.t_rig_body);
        let t_rig_tool = tool.pose.as_ref().map(|p| &p.t_rig_body);

        if self.pivot_capture {
            if let (Some(r), Some(t)) = (t_rig_ref, t_rig_tool) {
                self.pivot_samples.push(TransformComposer::relative(r, t));
            }
        }

        let composed = self.composer.compose(t_rig_ref, t_rig_tool);

        let (smoothed_ref_to_tool, smoothed_ct_to_tool, published) = match &composed {
            Some(out) => {
                let ref_to_tool = self.ref_smoother.apply(&out.ref_to_tool);
                let ct_to_tool = out.ct_to_tool.map(|t| self.ct_smoother.apply(&t));
                let published = self.publish(&ref_to_tool, ct_to_tool.as_ref());
                (Some(ref_to_tool), ct_to_tool, published)
            }
            None => {
                self.ref_smoother.mark_missing();
                self.ct_smoother.mark_missing();
                (self.ref_smoother.current(), self.ct_smoother.current(), false)
            }
        };

        let result = FrameResult {
            frame_index: frame.frame_index,
            timestamp_ns: frame.timestamp_ns,
            accepted_observations: accepted.len(),
            rejected,
            reference,
            tool,
            composed,
            smoothed_ref_to_tool,
            smoothed_ct_to_tool,
            published,
        };
        self.log_frame(&result);
        result
    }

    fn publish(&self, ref_to_tool: &SE3, ct_to_tool: Option<&SE3>) -> bool {
        let publisher = match &self.publisher {
            Some(p) => p,
            None => return false,
        };
        let mut all_queued = publisher.publish(&self.channels.ref_to_tool, ref_to_tool);
        if let Some(t) = ct_to_tool {
            all_queued &= publisher.publish(&self.channels.ct_to_tool, t);
        }
        all_queued
    }

    fn log_frame(&mut self, result: &FrameResult) {
        let log = match self.log.as_mut() {
            Some(l) => l,
            None => return,
        };

        let reference = result.reference.pose.as_ref();
        let tool = result.tool.pose.as_ref();
        let ref_pos = reference.map(|p| p.t_rig_body.translation);
        let tool_pos = tool.map(|p| p.t_rig_body.translation);
        let relative = result.composed.as_ref().map(|c| c.ref_to_tool.translation);
        let tip = result.composed.as_ref().and_then(|c| c.tip_in_ref);

        let record = NavLogRecord {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            timestamp_ns: result.timestamp_ns,
            frame: result.frame_index,
            reference_visible: result.reference.state.is_visible(),
            reference_confidence: reference.map(|p| p.confidence),
            reference_x: ref_pos.map(|v| v.x),
            reference_y: ref_pos.map(|v| v.y),
            reference_z: ref_pos.map(|v| v.z),
            tool_visible: result.tool.state.is_visible(),
            tool_confidence: tool.map(|p| p.confidence),
            tool_markers: tool
                .map(|p| {
                    p.marker_ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(";")
                })
                .unwrap_or_default(),
            tool_x: tool_pos.map(|v| v.x),
            tool_y: tool_pos.map(|v| v.y),
            tool_z: tool_pos.map(|v| v.z),
            relative_x_mm: relative.map(|v| v.x),
            relative_y_mm: relative.map(|v| v.y),
            relative_z_mm: relative.map(|v| v.z),
            distance_mm: relative.map(|v| v.norm()),
            tip_x_mm: tip.map(|v| v.x),
            tip_y_mm: tip.map(|v| v.y),
            tip_z_mm: tip.map(|v| v.z),
        };

        if let Err(e) = log.write(&record) {
            warn!("Navigation log write failed, logging disabled: {:#}", e);
            self.log = None;
        }
    }

    fn tracker(&self, body: TrackedBody) -> &BodyTracker {
        match body {
            TrackedBody::Reference => &self.reference,
            TrackedBody::Tool => &self.tool,
        }
    }

    pub fn model_handle(&self, body: TrackedBody) -> &BodyModelHandle {
        self.tracker(body).model()
    }

    pub fn rig(&self) -> &CameraRig {
        &self.rig
    }

    /// Validated observations usable for calibrating `body`, per frame, in
    /// the form the rigid-body calibrator consumes.
    ///
    /// Markers of the other tracked body are dropped. Everything else is kept,
    /// so markers missing from `body`'s current model can be discovered.
    pub fn calibration_frames(
        &self,
        body: TrackedBody,
        frames: &[DetectionFrame],
    ) -> Vec<CalibrationFrame> {
        let other = self.model_handle(body.other()).load();
        frames
            .iter()
            .map(|frame| {
                let (accepted, _) = self.validator.filter(&frame.observations, &self.rig);
                CalibrationFrame {
                    frame_index: frame.frame_index,
                    observations: accepted
                        .into_iter()
                        .filter(|o| !other.contains(o.marker_id()))
                        .collect(),
                }
            })
            .filter(|f| !f.observations.is_empty())
            .collect()
    }

    /// Refine a body's marker offsets from captured frames and publish the
    /// result to the tracker. On any error the current model stays in place.
    pub fn recalibrate_body(
        &self,
        body: TrackedBody,
        frames: &[DetectionFrame],
        should_stop: &dyn Fn() -> bool,
    ) -> Result<CalibrationReport, NavError> {
        let handle = self.model_handle(body);
        let initial = handle.load();
        let dataset = self.calibration_frames(body, frames);
        info!(
            "Calibrating body '{}' from {} frames ({} captured)",
            initial.name,
            dataset.len(),
            frames.len()
        );

        let calibrator = RigidBodyCalibrator::new(self.calibration.clone())
            .with_fusion_epsilon(self.fusion.epsilon);
        let (model, report) = calibrator.calibrate(
            &dataset,
            &self.rig,
            self.validator.marker_edge(),
            &initial,
            should_stop,
        )?;
        handle.swap(model);
        Ok(report)
    }

    /// Start collecting reference-relative tool poses (tracking units).
    pub fn start_pivot_capture(&mut self) {
        self.pivot_samples.clear();
        self.pivot_capture = true;
    }

    pub fn pivot_samples(&self) -> &[SE3] {
        &self.pivot_samples
    }

    /// Stop capturing and solve for the tip. On success the tip offset is
    /// used for composition from the next frame on; on failure the samples
    /// are kept for inspection.
    pub fn finish_pivot_capture(&mut self) -> Result<PivotResult, NavError> {
        self.pivot_capture = false;
        let result = self.pivot.calibrate(&self.pivot_samples)?;
        self.composer.set_tip_offset(Some(result.tip_offset));
        Ok(result)
    }

    /// Mean fused position of `body` over `frames`, in tracking units. The
    /// trackers are not advanced.
    pub fn body_position(
        &self,
        body: TrackedBody,
        frames: &[DetectionFrame],
    ) -> Result<Vector3<f64>, NavError> {
        let model = self.model_handle(body).load();
        let mut fusion = BodyPoseFusion::new(self.fusion.clone());
        let mut sum = Vector3::zeros();
        let mut count = 0usize;
        for frame in frames {
            let (accepted, _) = self.validator.filter(&frame.observations, &self.rig);
            if let Ok(pose) = fusion.fuse(&accepted, &model, &self.rig) {
                sum += pose.t_rig_body.translation;
                count += 1;
            }
        }
        if count == 0 {
            return Err(NavError::InsufficientObservations {
                body: model.name.clone(),
            });
        }
        Ok(sum / count as f64)
    }

    /// Scale calibration from repeats of one known move of `body`. Each
    /// repeat holds the frames captured at rest before and after the move.
    /// The resulting record is applied before it is returned.
    pub fn calibrate_scale(
        &mut self,
        body: TrackedBody,
        expected_distance_mm: f64,
        repeats: &[(&[DetectionFrame], &[DetectionFrame])],
    ) -> Result<ScaleRecord> {
        let mut measured = Vec::with_capacity(repeats.len());
        for (i, (start, end)) in repeats.iter().enumerate() {
            let from = self
                .body_position(body, start)
                .with_context(|| format!("Scale repeat {}: no start position", i))?;
            let to = self
                .body_position(body, end)
                .with_context(|| format!("Scale repeat {}: no end position", i))?;
            let units = displacement(&from, &to);
            debug!("Scale repeat {}: {:.4} units", i, units);
            measured.push(units);
        }
        let record = calibrate_scale(expected_distance_mm, &measured)?;
        self.set_scale_record(record.clone());
        Ok(record)
    }

    pub fn set_tip_offset(&mut self, tip_offset: Option<Vector3<f64>>) {
        self.composer.set_tip_offset(tip_offset);
    }

    pub fn set_registration(&mut self, t_ct_ref: Option<SE3>) {
        if t_ct_ref.is_none() {
            self.ct_smoother.reset();
        }
        self.composer.set_registration(t_ct_ref);
    }

    /// Apply a scale calibration. A record outside the acceptance threshold
    /// is still applied, with a warning.
    pub fn set_scale_record(&mut self, record: ScaleRecord) {
        if !record.is_accepted() {
            warn!(
                "Scale record from {} has {:.2}% error",
                record.calibrated_at, record.error_percent
            );
        }
        self.composer.set_scale(record.scale_factor);
        // Smoothed state is in the old units
        self.ref_smoother.reset();
        self.ct_smoother.reset();
        self.scale_record = Some(record);
    }

    pub fn scale_record(&self) -> Option<&ScaleRecord> {
        self.scale_record.as_ref()
    }

    pub fn publisher(&self) -> Option<&TransformPublisher> {
        self.publisher.as_ref()
    }

    /// Restart tracking of both bodies and drop the smoothing state.
    pub fn reset(&mut self) {
        self.reference.reset();
        self.tool.reset();
        self.ref_smoother.reset();
        self.ct_smoother.reset();
    }

    /// Flush the log and stop the publisher thread.
    pub fn shutdown(&mut self) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush() {
                warn!("Failed to flush navigation log: {:#}", e);
            }
        }
        if let Some(mut publisher) = self.publisher.take() {
            publisher.shutdown();
            let status = publisher.status();
            info!(
                "Publisher stopped: sent={}, dropped={}, failures={}",
                status.sent(),
                status.dropped(),
                status.failures()
            );
        }
    }
}

impl Drop for NavigationSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
