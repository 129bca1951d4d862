//! Pivot calibration of an instrument tip.
//!
//! While the tip rests in a fixed divot and the instrument is swivelled, every
//! reference-relative instrument pose `(R_k, t_k)` satisfies
//!
//! ```text
//! R_k · p_tip + t_k = c_pivot    =>    [R_k  -I] [p_tip; c_pivot] = -t_k
//! ```
//!
//! Stacking N poses gives a 3N×6 linear system solved in the least-squares
//! sense through the SVD. Rotations about a single axis leave the tip
//! component along that axis unobservable, which shows up as a large
//! condition number.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NavError;
use crate::geometry::SE3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PivotConfig {
    pub min_frames: usize,
    /// Largest accepted σ_max / σ_min of the stacked system.
    pub max_condition_number: f64,
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            min_frames: 6,
            max_condition_number: 1e4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotResult {
    /// Tip in instrument-body coordinates.
    pub tip_offset: Vector3<f64>,
    /// Pivot point in reference coordinates.
    pub pivot_point: Vector3<f64>,
    /// RMS distance between each frame's tip estimate and the pivot point.
    pub residual_rms: f64,
    pub condition_number: f64,
    pub frames_used: usize,
}

pub struct PivotCalibrator {
    config: PivotConfig,
}

impl PivotCalibrator {
    pub fn new(config: PivotConfig) -> Self {
        Self { config }
    }

    /// Solve for tip offset and pivot point from `T_ref_tool` samples.
    pub fn calibrate(&self, poses: &[SE3]) -> Result<PivotResult, NavError> {
        let n = poses.len();
        if n < self.config.min_frames.max(2) {
            return Err(NavError::PivotTooFewFrames {
                required: self.config.min_frames.max(2),
                got: n,
            });
        }

        let mut a = DMatrix::zeros(3 * n, 6);
        let mut b = DVector::zeros(3 * n);
        for (k, pose) in poses.iter().enumerate() {
            let row = 3 * k;
            a.view_mut((row, 0), (3, 3)).copy_from(&pose.rotation_matrix());
            for i in 0..3 {
                a[(row + i, 3 + i)] = -1.0;
                b[row + i] = -pose.translation[i];
            }
        }

        let svd = a.svd(true, true);
        let sigma_max = svd.singular_values.max();
        let sigma_min = svd.singular_values.min();
        let condition_number = if sigma_min > 0.0 {
            sigma_max / sigma_min
        } else {
            f64::INFINITY
        };
        if condition_number.is_nan() || condition_number > self.config.max_condition_number {
            return Err(NavError::PivotIllConditioned { condition_number });
        }

        let x = svd
            .solve(&b, 1e-12)
            .map_err(|_| NavError::PivotIllConditioned { condition_number })?;
        let tip_offset = Vector3::new(x[0], x[1], x[2]);
        let pivot_point = Vector3::new(x[3], x[4], x[5]);

        let sum_sq: f64 = poses
            .iter()
            .map(|p| (p.transform_point(&tip_offset) - pivot_point).norm_squared())
            .sum();
        let residual_rms = (sum_sq / n as f64).sqrt();

        info!(
            "Pivot calibration: tip [{:.3}, {:.3}, {:.3}], pivot [{:.3}, {:.3}, {:.3}], RMS {:.4}, cond {:.1}, {} frames",
            tip_offset.x,
            tip_offset.y,
            tip_offset.z,
            pivot_point.x,
            pivot_point.y,
            pivot_point.z,
            residual_rms,
            condition_number,
            n
        );

        Ok(PivotResult {
            tip_offset,
            pivot_point,
            residual_rms,
            condition_number,
            frames_used: n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Unit, UnitQuaternion};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pivot_poses(rotations: &[UnitQuaternion<f64>], tip: Vector3<f64>, pivot: Vector3<f64>) -> Vec<SE3> {
        rotations
            .iter()
            .map(|r| SE3 {
                rotation: *r,
                translation: pivot - *r * tip,
            })
            .collect()
    }

    fn random_rotations(count: usize, seed: u64) -> Vec<UnitQuaternion<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let axis = Unit::new_normalize(Vector3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                ));
                UnitQuaternion::from_axis_angle(&axis, rng.gen_range(0.2..1.0))
            })
            .collect()
    }

    #[test]
    fn test_noiseless_recovery() {
        let tip = Vector3::new(0.0, 0.0, 50.0);
        let pivot = Vector3::new(10.0, 10.0, 10.0);
        let poses = pivot_poses(&random_rotations(12, 7), tip, pivot);

        let res = PivotCalibrator::new(PivotConfig::default()).calibrate(&poses).unwrap();

        assert_relative_eq!(res.tip_offset, tip, epsilon = 1e-6);
        assert_relative_eq!(res.pivot_point, pivot, epsilon = 1e-6);
        assert!(res.residual_rms < 1e-6);
        assert_eq!(res.frames_used, 12);
    }

    #[test]
    fn test_noisy_recovery_is_close() {
        let tip = Vector3::new(3.0, -2.0, 120.0);
        let pivot = Vector3::new(-40.0, 15.0, 200.0);
        let mut poses = pivot_poses(&random_rotations(40, 11), tip, pivot);
        let mut rng = StdRng::seed_from_u64(3);
        for p in poses.iter_mut() {
            p.translation += Vector3::new(
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
            );
        }

        let res = PivotCalibrator::new(PivotConfig::default()).calibrate(&poses).unwrap();
        assert!((res.tip_offset - tip).norm() < 1.0);
        assert!((res.pivot_point - pivot).norm() < 1.0);
        assert!(res.residual_rms > 0.0);
    }

    #[test]
    fn test_too_few_frames() {
        let poses = pivot_poses(&random_rotations(3, 1), Vector3::zeros(), Vector3::zeros());
        let res = PivotCalibrator::new(PivotConfig::default()).calibrate(&poses);
        assert!(matches!(
            res,
            Err(NavError::PivotTooFewFrames { required: 6, got: 3 })
        ));
    }

    #[test]
    fn test_single_axis_rotation_is_ill_conditioned() {
        let rotations: Vec<_> = (0..10)
            .map(|i| UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.1 * i as f64))
            .collect();
        let poses = pivot_poses(&rotations, Vector3::new(0.0, 0.0, 50.0), Vector3::new(1.0, 2.0, 3.0));

        let res = PivotCalibrator::new(PivotConfig::default()).calibrate(&poses);
        assert!(matches!(res, Err(NavError::PivotIllConditioned { .. })));
    }
}
