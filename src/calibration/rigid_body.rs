//! Rigid-body marker calibration by bundle adjustment.
//!
//! Estimates the `T_body_marker` offset of every marker of a body from a set
//! of frames in which several of its markers are visible together.
//!
//! # Problem
//!
//! Unknowns are one 6-DoF block per marker (`T_body_marker`) and one per frame
//! (`T_rig_body`), each stored as `[rotation vector (3), translation (3)]`.
//! Every observed corner contributes two residuals:
//!
//! ```text
//! r = π(T_cam_rig ∘ T_rig_body(f) ∘ T_body_marker(m) · q_k) - u_k
//! ```
//!
//! # Gauge
//!
//! Any `G` in `T_rig_body ∘ G`, `G⁻¹ ∘ T_body_marker` leaves the residuals
//! unchanged. The anchor marker's block is therefore held fixed: it has no
//! offset in the parameter vector and its pose comes from the initial model.
//!
//! # Solver
//!
//! Levenberg-Marquardt on the normal equations
//!
//! ```text
//! (J^T J + λ diag(J^T J)) δ = -J^T r
//! ```
//!
//! with analytic Jacobians, driven through the `LeastSquaresProblem` trait.

use std::collections::{BTreeMap, HashMap};

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DMatrix, DVector, Dyn, Matrix2x3, Matrix3, Owned, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NavError;
use crate::geometry::so3::rotate_point_jacobian;
use crate::geometry::{marker_corners, CameraModel, CameraRig, SE3};
use crate::model::BodyModel;
use crate::tracking::fusion::{fuse_candidates, pose_candidates, FusionConfig};
use crate::tracking::ValidatedObservation;

/// Parameters per pose block.
const BLOCK: usize = 6;

/// Squared-residual sum treated as an exact fit.
const NUMERICAL_ZERO_COST: f64 = 1e-20;

/// Observations of one capture instant used for calibration.
#[derive(Debug, Clone, Default)]
pub struct CalibrationFrame {
    pub frame_index: u64,
    pub observations: Vec<ValidatedObservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigidBodyCalibrationConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Stop when an accepted step lowers the cost by less than this fraction.
    pub cost_tolerance: f64,
    /// Stop when the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Consecutive rejected steps before giving up.
    pub max_rejected_steps: usize,
    /// Initial LM damping.
    pub initial_lambda: f64,
    /// Marker held fixed to remove the gauge freedom. Defaults to the lowest
    /// id of the initial model.
    pub anchor_marker: Option<u32>,
}

impl Default for RigidBodyCalibrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
            max_rejected_steps: 10,
            initial_lambda: 1e-3,
            anchor_marker: None,
        }
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CostTolerance,
    ZeroCost,
    GradientTolerance,
    MaxIterations,
    /// Steps kept being rejected after the cost had already decreased.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    /// RMS corner reprojection error of the initial estimate (px).
    pub rms_before: f64,
    /// RMS corner reprojection error after optimization (px).
    pub rms_after: f64,
    pub iterations: usize,
    pub frames_used: usize,
    pub observations_used: usize,
    pub anchor_marker: u32,
    /// Markers whose offsets were estimated (anchor excluded).
    pub markers_optimized: Vec<u32>,
    pub termination: Termination,
}

/// One marker observation mapped onto the parameter vector.
#[derive(Debug, Clone)]
struct ObservationTerm {
    /// Offset of the marker block, `None` for the fixed anchor.
    marker_param_idx: Option<usize>,
    marker_id: u32,
    frame_param_idx: usize,
    t_cam_rig: SE3,
    camera: CameraModel,
    observed: [Vector2<f64>; 4],
}

/// The calibration least-squares problem.
#[derive(Debug, Clone)]
struct BodyCalibrationProblem {
    params: DVector<f64>,
    terms: Vec<ObservationTerm>,
    corners: [Vector3<f64>; 4],
    fixed_markers: HashMap<u32, SE3>,
}

impl BodyCalibrationProblem {
    fn block(&self, idx: usize) -> (Vector3<f64>, Vector3<f64>) {
        let p = &self.params;
        (
            Vector3::new(p[idx], p[idx + 1], p[idx + 2]),
            Vector3::new(p[idx + 3], p[idx + 4], p[idx + 5]),
        )
    }

    fn block_pose(&self, idx: usize) -> SE3 {
        let (phi, t) = self.block(idx);
        SE3::from_rvec_tvec(phi, t)
    }

    fn marker_pose(&self, term: &ObservationTerm) -> Option<SE3> {
        match term.marker_param_idx {
            Some(idx) => Some(self.block_pose(idx)),
            None => self.fixed_markers.get(&term.marker_id).copied(),
        }
    }

    fn num_residuals(&self) -> usize {
        self.terms.len() * 8
    }

    /// Sum of squared residuals; infinite when a corner leaves the camera's
    /// front half-space.
    fn cost(&self) -> f64 {
        match self.residuals() {
            Some(r) => r.norm_squared(),
            None => f64::INFINITY,
        }
    }

    fn rms(&self, cost: f64) -> f64 {
        if self.terms.is_empty() {
            return 0.0;
        }
        // Per-corner pixel RMS: two residuals per corner
        (cost / (self.num_residuals() / 2) as f64).sqrt()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BodyCalibrationProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(self.num_residuals());
        for (i, term) in self.terms.iter().enumerate() {
            let t_rig_body = self.block_pose(term.frame_param_idx);
            let t_cam_marker = term
                .t_cam_rig
                .compose(&t_rig_body)
                .compose(&self.marker_pose(term)?);
            for (k, corner) in self.corners.iter().enumerate() {
                let predicted = term.camera.project(&t_cam_marker.transform_point(corner))?;
                let e = predicted - term.observed[k];
                r[i * 8 + 2 * k] = e.x;
                r[i * 8 + 2 * k + 1] = e.y;
            }
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(self.num_residuals(), self.params.len());
        for (i, term) in self.terms.iter().enumerate() {
            let (phi_f, t_f) = self.block(term.frame_param_idx);
            let t_rig_body = SE3::from_rvec_tvec(phi_f, t_f);
            let t_body_marker = self.marker_pose(term)?;

            let r_cam_rig: Matrix3<f64> = term.t_cam_rig.rotation_matrix();
            let r_cam_body = r_cam_rig * t_rig_body.rotation_matrix();

            for (k, corner) in self.corners.iter().enumerate() {
                let p_body = t_body_marker.transform_point(corner);
                let p_cam = term.t_cam_rig.transform_point(&t_rig_body.transform_point(&p_body));
                let (_, d_pixel): (_, Matrix2x3<f64>) = term.camera.project_with_jacobian(&p_cam)?;

                let row = i * 8 + 2 * k;

                // Frame block: p_cam = R_cr (R(φ_f) p_body + t_f) + t_cr
                let d_rot_f = d_pixel * r_cam_rig * rotate_point_jacobian(&phi_f, &p_body);
                let d_trans_f = d_pixel * r_cam_rig;
                jac.view_mut((row, term.frame_param_idx), (2, 3)).copy_from(&d_rot_f);
                jac.view_mut((row, term.frame_param_idx + 3), (2, 3)).copy_from(&d_trans_f);

                // Marker block: p_body = R(φ_m) q_k + t_m
                if let Some(m_idx) = term.marker_param_idx {
                    let (phi_m, _) = self.block(m_idx);
                    let d_rot_m = d_pixel * r_cam_body * rotate_point_jacobian(&phi_m, corner);
                    let d_trans_m = d_pixel * r_cam_body;
                    jac.view_mut((row, m_idx), (2, 3)).copy_from(&d_rot_m);
                    jac.view_mut((row, m_idx + 3), (2, 3)).copy_from(&d_trans_m);
                }
            }
        }
        Some(jac)
    }
}

pub struct RigidBodyCalibrator {
    config: RigidBodyCalibrationConfig,
    /// Weight regularizer for the frame initialization, as in tracking.
    fusion_epsilon: f64,
}

impl RigidBodyCalibrator {
    pub fn new(config: RigidBodyCalibrationConfig) -> Self {
        Self {
            config,
            fusion_epsilon: FusionConfig::default().epsilon,
        }
    }

    pub fn with_fusion_epsilon(mut self, epsilon: f64) -> Self {
        self.fusion_epsilon = epsilon;
        self
    }

    /// Refine `initial` from `frames`.
    ///
    /// Observed markers missing from `initial` are added, placed from frames
    /// whose pose is already known. Markers of the initial model that are
    /// never observed keep their initial offsets. The initial model itself is
    /// never modified.
    pub fn calibrate(
        &self,
        frames: &[CalibrationFrame],
        rig: &CameraRig,
        marker_edge: f64,
        initial: &BodyModel,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<(BodyModel, CalibrationReport), NavError> {
        let setup = self.build_problem(frames, rig, marker_edge, initial)?;
        let Setup {
            mut problem,
            anchor,
            optimized_markers,
            frames_used,
        } = setup;

        let (iterations, termination, rms_before, rms_after) =
            self.solve(&mut problem, should_stop)?;

        let mut markers: BTreeMap<u32, SE3> = initial.markers().clone();
        for (&id, &idx) in &optimized_markers {
            markers.insert(id, problem.block_pose(idx));
        }
        let model = BodyModel::new(initial.name.clone(), markers);

        let report = CalibrationReport {
            rms_before,
            rms_after,
            iterations,
            frames_used,
            observations_used: problem.terms.len(),
            anchor_marker: anchor,
            markers_optimized: optimized_markers.keys().copied().collect(),
            termination,
        };
        info!(
            "Body '{}' calibrated: RMS {:.4} -> {:.4} px, {} iterations ({:?}), {} frames, {} observations",
            model.name,
            report.rms_before,
            report.rms_after,
            report.iterations,
            report.termination,
            report.frames_used,
            report.observations_used
        );
        Ok((model, report))
    }

    /// Initialize all unknowns and lay out the parameter vector.
    fn build_problem(
        &self,
        frames: &[CalibrationFrame],
        rig: &CameraRig,
        marker_edge: f64,
        initial: &BodyModel,
    ) -> Result<Setup, NavError> {
        let anchor = self
            .config
            .anchor_marker
            .or_else(|| initial.first_marker_id())
            .ok_or_else(|| {
                NavError::InsufficientCalibrationData("initial body model has no markers".into())
            })?;
        let anchor_pose = *initial.marker(anchor).ok_or_else(|| {
            NavError::InsufficientCalibrationData(format!(
                "anchor marker {} is not in the initial model",
                anchor
            ))
        })?;

        let (markers, frame_poses) = initialize(frames, rig, initial, self.fusion_epsilon);

        let used_frames: Vec<usize> = frame_poses
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|_| i))
            .collect();
        let dropped = frames.len() - used_frames.len();
        if dropped > 0 {
            warn!(
                "Calibration: {} of {} frames could not be initialized and were dropped",
                dropped,
                frames.len()
            );
        }
        if used_frames.is_empty() {
            return Err(NavError::InsufficientCalibrationData(
                "no frame observes a marker of the initial model".into(),
            ));
        }

        // Observed, initialized markers other than the anchor get a block
        let mut observed_ids: Vec<u32> = used_frames
            .iter()
            .flat_map(|&i| frames[i].observations.iter().map(|o| o.marker_id()))
            .filter(|id| markers.contains_key(id))
            .collect();
        observed_ids.sort_unstable();
        observed_ids.dedup();
        if !observed_ids.contains(&anchor) {
            return Err(NavError::InsufficientCalibrationData(format!(
                "anchor marker {} is never observed",
                anchor
            )));
        }

        let mut optimized_markers: BTreeMap<u32, usize> = BTreeMap::new();
        let mut num_params = 0;
        for &id in observed_ids.iter().filter(|&&id| id != anchor) {
            optimized_markers.insert(id, num_params);
            num_params += BLOCK;
        }
        if optimized_markers.is_empty() {
            return Err(NavError::InsufficientCalibrationData(format!(
                "only the anchor marker {} is observed, no offset to estimate",
                anchor
            )));
        }
        let mut frame_param_idx: HashMap<usize, usize> = HashMap::new();
        for &i in &used_frames {
            frame_param_idx.insert(i, num_params);
            num_params += BLOCK;
        }

        let mut params = DVector::zeros(num_params);
        for (&id, &idx) in &optimized_markers {
            params
                .rows_mut(idx, BLOCK)
                .copy_from_slice(&markers[&id].log());
        }
        for (&i, &idx) in &frame_param_idx {
            if let Some(pose) = frame_poses[i] {
                params.rows_mut(idx, BLOCK).copy_from_slice(&pose.log());
            }
        }

        let mut terms = Vec::new();
        let mut skipped = 0usize;
        for &i in &used_frames {
            for obs in &frames[i].observations {
                let camera = match rig.camera(obs.camera_id()) {
                    Some(c) => c,
                    None => {
                        skipped += 1;
                        continue;
                    }
                };
                if !markers.contains_key(&obs.marker_id()) {
                    skipped += 1;
                    continue;
                }
                terms.push(ObservationTerm {
                    marker_param_idx: optimized_markers.get(&obs.marker_id()).copied(),
                    marker_id: obs.marker_id(),
                    frame_param_idx: frame_param_idx[&i],
                    t_cam_rig: camera.t_rig_cam.inverse(),
                    camera: camera.model,
                    observed: *obs.corners(),
                });
            }
        }
        if skipped > 0 {
            warn!("Calibration: skipped {} unusable observations", skipped);
        }

        let mut fixed_markers = HashMap::new();
        fixed_markers.insert(anchor, anchor_pose);

        debug!(
            "Calibration problem: {} marker blocks, {} frame blocks, {} observations",
            optimized_markers.len(),
            frame_param_idx.len(),
            terms.len()
        );

        Ok(Setup {
            problem: BodyCalibrationProblem {
                params,
                terms,
                corners: marker_corners(marker_edge),
                fixed_markers,
            },
            anchor,
            optimized_markers,
            frames_used: used_frames.len(),
        })
    }

    /// Manual LM loop. Returns (iterations, termination, rms_before, rms_after).
    fn solve(
        &self,
        problem: &mut BodyCalibrationProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<(usize, Termination, f64, f64), NavError> {
        let initial_cost = problem.cost();
        let rms_before = problem.rms(initial_cost);
        if !initial_cost.is_finite() {
            return Err(NavError::CalibrationDivergence {
                rms_before,
                rms_after: rms_before,
            });
        }

        let num_params = problem.params.len();
        let mut current_params = problem.params();
        let mut current_cost = initial_cost;
        let mut lambda = self.config.initial_lambda;
        let lambda_up = 10.0;
        let lambda_down = 0.1;
        let min_lambda = 1e-12;
        let max_lambda = 1e12;
        let mut rejected = 0usize;
        let mut iterations = 0;
        let mut termination = Termination::MaxIterations;

        if current_cost <= NUMERICAL_ZERO_COST || num_params == 0 {
            return Ok((0, Termination::ZeroCost, rms_before, rms_before));
        }

        for iter in 0..self.config.max_iterations {
            if should_stop() {
                info!("Calibration cancelled after {} iterations", iter);
                return Err(NavError::CalibrationCancelled);
            }
            iterations = iter + 1;

            let (residuals, jacobian) = match (problem.residuals(), problem.jacobian()) {
                (Some(r), Some(j)) => (r, j),
                _ => {
                    return Err(NavError::CalibrationDivergence {
                        rms_before,
                        rms_after: f64::INFINITY,
                    })
                }
            };

            let gradient = jacobian.transpose() * &residuals;
            if gradient.norm() < self.config.gradient_tolerance {
                termination = Termination::GradientTolerance;
                break;
            }
            let jtj = jacobian.transpose() * &jacobian;

            let mut damped = jtj;
            for i in 0..num_params {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-9);
            }

            let trial_cost = match damped.lu().solve(&(-&gradient)) {
                Some(delta) => {
                    let trial_params = &current_params + &delta;
                    if trial_params.iter().any(|v| !v.is_finite()) {
                        return Err(NavError::CalibrationDivergence {
                            rms_before,
                            rms_after: f64::NAN,
                        });
                    }
                    problem.set_params(&trial_params);
                    let cost = problem.cost();
                    if cost.is_nan() {
                        return Err(NavError::CalibrationDivergence {
                            rms_before,
                            rms_after: f64::NAN,
                        });
                    }
                    if cost < current_cost {
                        current_params = trial_params;
                    } else {
                        problem.set_params(&current_params);
                    }
                    cost
                }
                None => f64::INFINITY,
            };

            if trial_cost < current_cost {
                let relative_decrease = (current_cost - trial_cost) / current_cost;
                current_cost = trial_cost;
                lambda = (lambda * lambda_down).max(min_lambda);
                rejected = 0;
                debug!(
                    "LM iter {}: cost {:.6e}, lambda {:.1e}",
                    iterations, current_cost, lambda
                );

                if current_cost <= NUMERICAL_ZERO_COST {
                    termination = Termination::ZeroCost;
                    break;
                }
                if relative_decrease < self.config.cost_tolerance {
                    termination = Termination::CostTolerance;
                    break;
                }
            } else {
                lambda = (lambda * lambda_up).min(max_lambda);
                rejected += 1;
                if rejected >= self.config.max_rejected_steps {
                    if current_cost >= initial_cost {
                        warn!(
                            "Calibration diverged: {} consecutive rejected steps without improvement",
                            rejected
                        );
                        return Err(NavError::CalibrationDivergence {
                            rms_before,
                            rms_after: problem.rms(current_cost),
                        });
                    }
                    termination = Termination::Stalled;
                    break;
                }
            }
        }

        Ok((iterations, termination, rms_before, problem.rms(current_cost)))
    }
}

struct Setup {
    problem: BodyCalibrationProblem,
    anchor: u32,
    optimized_markers: BTreeMap<u32, usize>,
    frames_used: usize,
}

/// Alternate between initializing frames from known markers and markers from
/// initialized frames until neither makes progress.
fn initialize(
    frames: &[CalibrationFrame],
    rig: &CameraRig,
    initial: &BodyModel,
    epsilon: f64,
) -> (BTreeMap<u32, SE3>, Vec<Option<SE3>>) {
    let mut markers: BTreeMap<u32, SE3> = initial.markers().clone();
    let mut frame_poses: Vec<Option<SE3>> = vec![None; frames.len()];

    loop {
        let mut progress = false;

        for (i, frame) in frames.iter().enumerate() {
            if frame_poses[i].is_some() {
                continue;
            }
            let candidates = pose_candidates(&frame.observations, &markers, rig, epsilon);
            if let Some(fused) = fuse_candidates(&candidates, None) {
                frame_poses[i] = Some(fused.t_rig_body);
                progress = true;
            }
        }

        for (i, frame) in frames.iter().enumerate() {
            let t_rig_body = match frame_poses[i] {
                Some(p) => p,
                None => continue,
            };
            for obs in &frame.observations {
                if markers.contains_key(&obs.marker_id()) {
                    continue;
                }
                if let Some(camera) = rig.camera(obs.camera_id()) {
                    let t_body_marker = t_rig_body
                        .inverse()
                        .compose(&camera.t_rig_cam)
                        .compose(obs.t_cam_marker());
                    debug!(
                        "Marker {} initialized from frame {}",
                        obs.marker_id(),
                        frame.frame_index
                    );
                    markers.insert(obs.marker_id(), t_body_marker);
                    progress = true;
                }
            }
        }

        if !progress {
            break;
        }
    }

    (markers, frame_poses)
}
