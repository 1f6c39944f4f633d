//! Pure routing decisions for MQTT events
//!
//! Translates rumqttc events into [`EventRoute`] values, and failed polls into
//! [`SessionInterruption`] values, so the receive loop's decisions can be tested
//! without a broker.

use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, DisconnectReasonCode, Packet, PubAckReason, PubRecReason,
    SubscribeReasonCode,
};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered the CONNECT packet; `refused` carries the reason code on rejection
    ConnectionAcknowledged {
        session_present: bool,
        refused: Option<String>,
    },
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker sent DISCONNECT; `normal` when the reason code is zero
    Disconnected { reason: String, normal: bool },
    /// SUBSCRIBE packet left the client with this packet id
    SubscribeSent { pkid: u16 },
    /// PUBLISH packet left the client; `pkid` is zero for QoS 0
    PublishSent { pkid: u16 },
    /// Broker answered a SUBSCRIBE; `failures` lists rejected filter reason codes
    SubscriptionAcknowledged { pkid: u16, failures: Vec<String> },
    /// Broker answered a QoS 1 or QoS 2 publish; `failure` carries the reason code on rejection
    PublishAcknowledged { pkid: u16, failure: Option<String> },
    /// Our DISCONNECT packet was written
    OutgoingDisconnect,
    /// Pings and other protocol traffic
    Infrastructure(String),
    /// Other outgoing traffic
    Outgoing,
}

/// Route MQTT event to the appropriate receive-loop action
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => route_incoming(packet),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent { pkid: *pkid },
        Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { pkid: *pkid },
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::OutgoingDisconnect,
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}

fn route_incoming(packet: &Packet) -> EventRoute {
    match packet {
        Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
            session_present: connack.session_present,
            refused: match connack.code {
                ConnectReturnCode::Success => None,
                other => Some(format!("{other:?}")),
            },
        },
        Packet::Publish(publish) => EventRoute::MessageReceived {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.to_vec(),
            retain: publish.retain,
        },
        Packet::Disconnect(disconnect) => {
            let (reason, normal) = disconnect_reason(disconnect.reason_code);
            EventRoute::Disconnected { reason, normal }
        }
        Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
            pkid: suback.pkid,
            failures: suback
                .return_codes
                .iter()
                .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                .map(|code| format!("{code:?}"))
                .collect(),
        },
        Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
            pkid: puback.pkid,
            failure: match puback.reason {
                PubAckReason::Success | PubAckReason::NoMatchingSubscribers => None,
                other => Some(format!("{other:?}")),
            },
        },
        Packet::PubRec(pubrec) => EventRoute::PublishAcknowledged {
            pkid: pubrec.pkid,
            failure: match pubrec.reason {
                PubRecReason::Success | PubRecReason::NoMatchingSubscribers => None,
                other => Some(format!("{other:?}")),
            },
        },
        other => EventRoute::Infrastructure(format!("{other:?}")),
    }
}

fn disconnect_reason(code: DisconnectReasonCode) -> (String, bool) {
    (
        format!("{code:?}"),
        code == DisconnectReasonCode::NormalDisconnection,
    )
}

/// Why a poll of the event loop failed.
///
/// rumqttc reports a rejected SUBACK, PUBACK or PUBREC and a broker DISCONNECT
/// as poll errors and drops the network in every case.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInterruption {
    /// Broker refused one SUBSCRIBE filter
    SubscriptionRejected { reason: String },
    /// Broker refused one outbound publish
    PublishRejected { reason: String },
    /// Broker closed the session with DISCONNECT
    BrokerDisconnect { reason: String, normal: bool },
    /// Network, protocol or handshake failure
    ConnectionLost,
}

impl SessionInterruption {
    /// The broker refused one request while the session itself was healthy
    pub fn is_request_rejection(&self) -> bool {
        matches!(
            self,
            SessionInterruption::SubscriptionRejected { .. }
                | SessionInterruption::PublishRejected { .. }
        )
    }
}

/// Classify a failed poll
pub fn classify_connection_error(error: &ConnectionError) -> SessionInterruption {
    let ConnectionError::MqttState(state) = error else {
        return SessionInterruption::ConnectionLost;
    };
    match state {
        StateError::SubFail { reason } => SessionInterruption::SubscriptionRejected {
            reason: format!("{reason:?}"),
        },
        StateError::PubAckFail { reason } => SessionInterruption::PublishRejected {
            reason: format!("{reason:?}"),
        },
        StateError::PubRecFail { reason } => SessionInterruption::PublishRejected {
            reason: format!("{reason:?}"),
        },
        StateError::ServerDisconnect { reason_code, .. } => {
            let (reason, normal) = disconnect_reason(*reason_code);
            SessionInterruption::BrokerDisconnect { reason, normal }
        }
        _ => SessionInterruption::ConnectionLost,
    }
}
