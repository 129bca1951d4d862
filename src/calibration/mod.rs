//! Offline calibrations: marker offsets, instrument tip, length scale.

pub mod pivot;
pub mod rigid_body;
pub mod scale;

pub use pivot::{PivotCalibrator, PivotConfig, PivotResult};
pub use rigid_body::{
    CalibrationFrame, CalibrationReport, RigidBodyCalibrationConfig, RigidBodyCalibrator,
    Termination,
};
pub use scale::{calibrate_scale, displacement, ScaleRecord};
