//! Testing utilities and mock implementations
//!
//! Lets routing, handlers and publishing be tested without an MQTT broker or a
//! downstream task worker.

pub mod mocks;

pub use mocks::*;
