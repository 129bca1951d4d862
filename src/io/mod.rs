//! File formats: recorded detector sessions, the navigation log, and the JSON
//! registration and tip-offset files.

pub mod nav_log;
pub mod recording;
pub mod transform_file;

pub use nav_log::{NavLogRecord, NavLogWriter};
pub use recording::{load_recording, read_recording, save_recording, write_recording};
pub use transform_file::{load_registration, load_tip_offset, save_registration, save_tip_offset};
