//! Sensor Relay
//!
//! An IoT telemetry ingestion service: it subscribes to device topics on an
//! MQTT broker, routes each inbound message to the handler bound to its topic
//! pattern, hands durable work to a task queue and fans real-time events out to
//! connected WebSocket sessions. Commands travel the other way through
//! [`OutboundPublisher`].
//!
//! # Quick Start
//!
//! ```rust
//! use sensor_relay::config::RelayConfig;
//! use sensor_relay::service::RelayService;
//! use sensor_relay::testing::RecordingTaskQueue;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let tasks = Arc::new(RecordingTaskQueue::new());
//! let service = RelayService::with_task_queue(RelayConfig::default(), tasks.clone()).unwrap();
//! let mut updates = service.fanout().subscribe();
//!
//! // The receive loop calls this for every broker message
//! service
//!     .router()
//!     .dispatch("waste-wise/sensors/bin-42/data", br#"{"fill_level": 87}"#);
//!
//! assert_eq!(tasks.tasks().len(), 1);
//! assert_eq!(updates.try_recv().unwrap().data["sensor_id"], "bin-42");
//! # });
//! ```

pub mod config;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod service;
pub mod tasks;
pub mod testing;
pub mod transport;

pub use config::{BrokerConfig, ConfigError, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use fanout::FanOutBridge;
pub use protocol::*;
pub use routing::{DispatchOutcome, HandlerError, MessageHandler, TopicRouter};
pub use service::RelayService;
pub use transport::mqtt::{ConnectionManager, ConnectionState};
pub use transport::{OutboundPublisher, PublishError, Transport};
