//! Exponential smoothing of a tracked transform for display.

use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};

use crate::error::NavError;
use crate::geometry::so3::nlerp;
use crate::geometry::SE3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Weight of the newest sample, in (0, 1]. 1 disables smoothing.
    pub alpha: f64,
    /// Consecutive missing frames tolerated before the state is dropped.
    pub max_gap_frames: usize,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            max_gap_frames: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    alpha: f64,
    max_gap_frames: usize,
    previous: Option<SE3>,
    missed_frames: usize,
}

impl TemporalSmoother {
    pub fn new(config: &SmootherConfig) -> Result<Self, NavError> {
        if config.alpha.is_nan() || config.alpha <= 0.0 || config.alpha > 1.0 {
            return Err(NavError::InvalidSmoothingFactor(config.alpha));
        }
        Ok(Self {
            alpha: config.alpha,
            max_gap_frames: config.max_gap_frames,
            previous: None,
            missed_frames: 0,
        })
    }

    /// Blend a new sample into the state and return the smoothed transform.
    /// The first sample after construction or reset passes through unchanged.
    pub fn apply(&mut self, sample: &SE3) -> SE3 {
        self.missed_frames = 0;
        let out = match &self.previous {
            None => *sample,
            Some(prev) => SE3 {
                rotation: blend_rotation(&prev.rotation, &sample.rotation, self.alpha),
                translation: prev.translation * (1.0 - self.alpha) + sample.translation * self.alpha,
            },
        };
        self.previous = Some(out);
        out
    }

    /// Record a frame without a sample. After more than `max_gap_frames`
    /// consecutive misses the state is dropped so the next sample restarts.
    pub fn mark_missing(&mut self) {
        self.missed_frames += 1;
        if self.missed_frames > self.max_gap_frames {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.missed_frames = 0;
    }

    /// Last emitted transform, if the state is live.
    pub fn current(&self) -> Option<SE3> {
        self.previous
    }

    pub fn missed_frames(&self) -> usize {
        self.missed_frames
    }
}

fn blend_rotation(
    prev: &UnitQuaternion<f64>,
    next: &UnitQuaternion<f64>,
    alpha: f64,
) -> UnitQuaternion<f64> {
    if alpha >= 1.0 {
        return *next;
    }
    nlerp(prev, next, alpha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn pose(angle: f64, t: Vector3<f64>) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
            translation: t,
        }
    }

    fn smoother(alpha: f64) -> TemporalSmoother {
        TemporalSmoother::new(&SmootherConfig {
            alpha,
            max_gap_frames: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        for alpha in [0.0, -0.1, 1.5, f64::NAN] {
            let res = TemporalSmoother::new(&SmootherConfig {
                alpha,
                max_gap_frames: 2,
            });
            assert!(matches!(res, Err(NavError::InvalidSmoothingFactor(_))));
        }
    }

    #[test]
    fn test_first_sample_passes_through() {
        let mut s = smoother(0.3);
        let p = pose(0.4, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(s.apply(&p), p);
    }

    #[test]
    fn test_alpha_one_returns_input() {
        let mut s = smoother(1.0);
        s.apply(&pose(0.0, Vector3::zeros()));
        let p = pose(0.7, Vector3::new(10.0, -5.0, 2.0));

        let out = s.apply(&p);
        assert_relative_eq!(out.translation, p.translation, epsilon = 1e-12);
        assert!(out.rotation_angle_to(&p) < 1e-12);
    }

    #[test]
    fn test_small_alpha_holds_previous() {
        let mut s = smoother(1e-9);
        let first = pose(0.1, Vector3::new(1.0, 1.0, 1.0));
        s.apply(&first);

        let out = s.apply(&pose(1.0, Vector3::new(100.0, 100.0, 100.0)));
        assert_relative_eq!(out.translation, first.translation, epsilon = 1e-6);
        assert!(out.rotation_angle_to(&first) < 1e-6);
    }

    #[test]
    fn test_translation_blend() {
        let mut s = smoother(0.25);
        s.apply(&pose(0.0, Vector3::new(0.0, 0.0, 0.0)));
        let out = s.apply(&pose(0.0, Vector3::new(8.0, 4.0, 0.0)));
        assert_relative_eq!(out.translation, Vector3::new(2.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_gap_resets_state() {
        let mut s = smoother(0.5);
        s.apply(&pose(0.0, Vector3::zeros()));

        s.mark_missing();
        s.mark_missing();
        assert!(s.current().is_some());

        s.mark_missing();
        assert!(s.current().is_none());

        // Restart: passes through
        let p = pose(0.3, Vector3::new(5.0, 0.0, 0.0));
        assert_eq!(s.apply(&p), p);
    }
}
