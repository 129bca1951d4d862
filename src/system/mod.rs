//! Navigation system orchestration.
//!
//! `NavigationSystem` drives the per-frame pipeline for the reference and tool
//! bodies and hosts the calibration workflows whose results feed it.

mod navigation_system;

pub use navigation_system::{FrameResult, NavigationSystem, TrackedBody};
