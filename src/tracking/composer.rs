//! Reference-relative and registration-relative transforms.
//!
//! ```text
//! T_ref_tool = inverse(T_rig_ref) ∘ T_rig_tool
//! T_ct_tool  = T_ct_ref ∘ T_ref_tool
//! ```
//!
//! Translations are converted from tracking units to millimetres by the scale
//! factor before the registration is applied; `T_ct_ref` is in millimetres.

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Transforms derived for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTransforms {
    pub ref_to_tool: SE3,
    pub ct_to_tool: Option<SE3>,
    /// Instrument tip in reference coordinates (mm).
    pub tip_in_ref: Option<Vector3<f64>>,
    /// Instrument tip in registration coordinates (mm).
    pub tip_in_ct: Option<Vector3<f64>>,
}

#[derive(Debug, Clone)]
pub struct TransformComposer {
    registration: Option<SE3>,
    scale: f64,
    /// Tip offset in instrument-body coordinates (tracking units).
    tip_offset: Option<Vector3<f64>>,
}

impl Default for TransformComposer {
    fn default() -> Self {
        Self {
            registration: None,
            scale: 1.0,
            tip_offset: None,
        }
    }
}

impl TransformComposer {
    pub fn new(registration: Option<SE3>, scale: f64, tip_offset: Option<Vector3<f64>>) -> Self {
        Self {
            registration,
            scale,
            tip_offset,
        }
    }

    pub fn set_registration(&mut self, t_ct_ref: Option<SE3>) {
        self.registration = t_ct_ref;
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    pub fn set_tip_offset(&mut self, tip: Option<Vector3<f64>>) {
        self.tip_offset = tip;
    }

    pub fn registration(&self) -> Option<&SE3> {
        self.registration.as_ref()
    }

    /// `inverse(T_rig_ref) ∘ T_rig_tool`, in tracking units.
    pub fn relative(t_rig_ref: &SE3, t_rig_tool: &SE3) -> SE3 {
        t_rig_ref.inverse().compose(t_rig_tool)
    }

    /// Compose this frame's outputs. `None` when either body is missing.
    pub fn compose(
        &self,
        t_rig_ref: Option<&SE3>,
        t_rig_tool: Option<&SE3>,
    ) -> Option<ComposedTransforms> {
        let (t_rig_ref, t_rig_tool) = (t_rig_ref?, t_rig_tool?);

        let mut ref_to_tool = Self::relative(t_rig_ref, t_rig_tool);
        ref_to_tool.translation *= self.scale;

        let ct_to_tool = self.to_registration(&ref_to_tool);
        let tip_in_ref = self.tip_in(&ref_to_tool);
        let tip_in_ct = match (&self.registration, tip_in_ref) {
            (Some(t_ct_ref), Some(tip)) => Some(t_ct_ref.transform_point(&tip)),
            _ => None,
        };

        Some(ComposedTransforms {
            ref_to_tool,
            ct_to_tool,
            tip_in_ref,
            tip_in_ct,
        })
    }

    /// `T_ct_ref ∘ T_ref_tool` when a registration is loaded.
    pub fn to_registration(&self, ref_to_tool: &SE3) -> Option<SE3> {
        self.registration.map(|t_ct_ref| t_ct_ref.compose(ref_to_tool))
    }

    /// Tip position through an already scaled tool transform.
    pub fn tip_in(&self, scaled_t_x_tool: &SE3) -> Option<Vector3<f64>> {
        self.tip_offset
            .map(|tip| scaled_t_x_tool.transform_point(&(tip * self.scale)))
    }
}
