//! Topic conventions and message types for sensor telemetry traffic

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::{
    topic_segment, validate_device_id, validate_publish_topic, TopicBuilder, TopicError,
    TopicPattern,
};
