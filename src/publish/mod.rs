//! Transform streaming over OpenIGTLink.

pub mod igtl;
pub mod publisher;

pub use igtl::{ChannelName, TransformMessage, decode_transform, encode_transform};
pub use publisher::{PublisherConfig, PublisherStatus, TransformPublisher};
