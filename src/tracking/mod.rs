//! Per-frame tracking pipeline: validation, fusion, composition, smoothing.

pub mod body_tracker;
pub mod composer;
pub mod detector;
pub mod fusion;
pub mod observation;
pub mod smoother;
pub mod validator;

pub use body_tracker::{BodyTracker, BodyTrackingResult, TrackingState};
pub use composer::{ComposedTransforms, TransformComposer};
pub use detector::{MarkerDetector, RecordedDetector};
pub use fusion::{BodyPoseFusion, FusedPose, FusionConfig, PoseCandidate};
pub use observation::{DetectionFrame, MarkerObservation, ValidatedObservation};
pub use smoother::{SmootherConfig, TemporalSmoother};
pub use validator::{PoseValidator, ValidatorConfig};
