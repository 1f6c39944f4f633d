//! Inbound message routing
//!
//! Maps broker topics to handlers through an ordered, immutable pattern table.

pub mod router;

pub use router::{DispatchOutcome, HandlerError, MessageHandler, TopicRouter};
