pub mod calibration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod model;
pub mod publish;
pub mod system;
pub mod tracking;

pub use error::NavError;
