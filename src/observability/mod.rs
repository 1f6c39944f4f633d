//! Observability: structured logging and in-process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use logging::{dispatch_span, mqtt_span};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};
