//! Geometry utilities: SE3 transforms, SO(3) helpers, camera and marker models.

pub mod camera;
pub mod marker;
pub mod se3;
pub mod so3;

pub use camera::{CameraModel, CameraRig, RigCamera};
pub use marker::marker_corners;
pub use se3::SE3;
