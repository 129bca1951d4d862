//! Body models and the shared handle used to publish calibrated ones.

pub mod body_model;
pub mod handle;

pub use body_model::BodyModel;
pub use handle::BodyModelHandle;
