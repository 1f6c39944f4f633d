//! Pure connection state management for the MQTT client
//!
//! Connection state, transport errors and option building from [`BrokerConfig`].

use crate::config::{BrokerConfig, MIN_KEEP_ALIVE_SECS};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Max inbound/outbound packet size
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Broker connection state. There is no automatic reconnection, so
/// `Disconnected` is both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No broker acknowledgement within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    #[error("Keep-alive of {0:?} is below the {MIN_KEEP_ALIVE_SECS}s minimum")]
    InvalidKeepAlive(Duration),
}

/// Map a numeric QoS level to the rumqttc type
pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Client id unique per connection attempt to prevent broker session takeover
pub fn unique_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// Build rumqttc options from broker configuration
pub fn build_mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, MqttError> {
    if config.keep_alive.as_secs() < MIN_KEEP_ALIVE_SECS {
        return Err(MqttError::InvalidKeepAlive(config.keep_alive));
    }

    let mut options = MqttOptions::new(
        unique_client_id(&config.client_id),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_clean_start(true);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(credentials) = &config.credentials {
        options.set_credentials(credentials.username.as_str(), credentials.password.as_str());
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, Credentials};

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_level(3), Err(MqttError::InvalidQos(3))));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = unique_client_id("sensor-relay");
        let b = unique_client_id("sensor-relay");
        assert!(a.starts_with("sensor-relay-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_build_options() {
        let config = BrokerConfig {
            host: "broker.local".to_string(),
            port: 1884,
            keep_alive: Duration::from_secs(30),
            credentials: Some(Credentials {
                username: "relay".to_string(),
                password: "secret".to_string(),
            }),
            ..BrokerConfig::default()
        };

        let options = build_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.client_id().starts_with(&config.client_id));
    }

    #[test]
    fn test_short_keep_alive_is_an_error() {
        for keep_alive in [Duration::ZERO, Duration::from_secs(1), Duration::from_millis(4_999)] {
            let config = BrokerConfig {
                keep_alive,
                ..BrokerConfig::default()
            };
            assert!(matches!(
                build_mqtt_options(&config),
                Err(MqttError::InvalidKeepAlive(d)) if d == keep_alive
            ));
        }

        let config = BrokerConfig {
            keep_alive: Duration::from_secs(MIN_KEEP_ALIVE_SECS),
            ..BrokerConfig::default()
        };
        assert!(build_mqtt_options(&config).is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
