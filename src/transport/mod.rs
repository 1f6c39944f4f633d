//! Transport layer: broker connection and outbound publishing
//!
//! The [`Transport`] trait is the publish seam between the relay and the broker
//! so that [`OutboundPublisher`] can be tested without a network connection.

pub mod mqtt;

use crate::observability::metrics::metrics;
use crate::protocol::{validate_publish_topic, CommandMessage, JsonObject, TopicBuilder, TopicError};
use async_trait::async_trait;
use mqtt::{ConnectionState, QoS};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Outbound publish failures. Never retried.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Failed to serialize payload for '{topic}'")]
    Serialization {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid publish topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Broker rejected publish: {0}")]
    Rejected(String),
}

/// Publish seam over the broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit an already-serialized payload
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Serializes payloads as JSON and hands them to the transport.
///
/// A successful return means the transport accepted the publish. The MQTT
/// receive loop logs delivery once the packet is written (QoS 0) or the broker
/// acknowledges it.
#[derive(Clone)]
pub struct OutboundPublisher {
    transport: Arc<dyn Transport>,
    topics: TopicBuilder,
}

impl OutboundPublisher {
    pub fn new(transport: Arc<dyn Transport>, topics: TopicBuilder) -> Self {
        Self { transport, topics }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Serialize `payload` and publish it with the given QoS
    pub async fn publish<T>(&self, topic: &str, payload: &T, qos: QoS) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let result = self.try_publish(topic, payload, qos).await;
        match &result {
            Ok(()) => debug!(topic = %topic, qos = ?qos, "Publish queued for delivery"),
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to publish message");
                metrics().mqtt_publish_failed();
            }
        }
        result
    }

    async fn try_publish<T>(&self, topic: &str, payload: &T, qos: QoS) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        validate_publish_topic(topic)?;
        let bytes = serde_json::to_vec(payload).map_err(|source| PublishError::Serialization {
            topic: topic.to_string(),
            source,
        })?;
        self.transport.publish(topic, bytes, qos).await
    }

    /// Send a command to one device on `{namespace}/commands/{device_id}`
    /// with at-least-once delivery
    pub async fn send_command(
        &self,
        device_id: &str,
        command: &str,
        parameters: JsonObject,
    ) -> Result<(), PublishError> {
        let topic = match self.topics.command_topic(device_id) {
            Ok(topic) => topic,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Invalid command target");
                metrics().mqtt_publish_failed();
                return Err(e.into());
            }
        };

        let message = CommandMessage::new(command, parameters);
        self.publish(&topic, &message, QoS::AtLeastOnce).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::{json, Value};

    fn publisher(transport: Arc<MockTransport>) -> OutboundPublisher {
        OutboundPublisher::new(transport, TopicBuilder::new("demo"))
    }

    #[tokio::test]
    async fn test_publish_serializes_json() {
        let transport = Arc::new(MockTransport::new());
        publisher(transport.clone())
            .publish("demo/out", &json!({"a": 1}), QoS::AtMostOnce)
            .await
            .unwrap();

        let published = transport.get_published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "demo/out");
        assert_eq!(
            serde_json::from_slice::<Value>(&published[0].1).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(published[0].2, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_topic() {
        let transport = Arc::new(MockTransport::new());
        let err = publisher(transport.clone())
            .publish("demo/+/out", &json!({}), QoS::AtMostOnce)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::InvalidTopic(_)));
        assert!(transport.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let transport = Arc::new(MockTransport::disconnected());
        let err = publisher(transport)
            .publish("demo/out", &json!({}), QoS::AtLeastOnce)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_broker_failure_is_returned_not_retried() {
        let transport = Arc::new(MockTransport::with_failure());
        let err = publisher(transport.clone())
            .send_command("abc123", "empty_bin", JsonObject::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Rejected(_)));
        assert!(transport.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_rejects_invalid_device_id() {
        let transport = Arc::new(MockTransport::new());
        let err = publisher(transport.clone())
            .send_command("a/b", "reset", JsonObject::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::InvalidTopic(TopicError::InvalidDeviceId(_))));
        assert!(transport.get_published_messages().is_empty());
    }
}
