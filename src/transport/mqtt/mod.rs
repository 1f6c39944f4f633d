//! MQTT v5 transport built on rumqttc
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - connection state, errors and option building
//! - [`events`] - pure routing of rumqttc events into receive-loop actions
//! - [`manager`] - connection lifecycle, subscriptions and the receive loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use sensor_relay::config::BrokerConfig;
//! use sensor_relay::routing::TopicRouter;
//! use sensor_relay::transport::mqtt::ConnectionManager;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut manager = ConnectionManager::new(BrokerConfig::default(), Arc::new(TopicRouter::new()));
//! manager.connect().await?;
//! manager.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod events;
pub mod manager;

pub use connection::{build_mqtt_options, qos_from_level, ConnectionState, MqttError};
pub use events::{classify_connection_error, route_mqtt_event, EventRoute, SessionInterruption};
pub use manager::{BrokerLink, ConnectionManager};
pub use rumqttc::v5::mqttbytes::QoS;
