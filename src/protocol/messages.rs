//! Wire messages: inbound payload schemas, outbound commands and fan-out events
//!
//! Every inbound payload is a UTF-8 JSON object. The router decodes it into a
//! [`JsonObject`]; handlers then validate it against the schema for their
//! message kind before doing anything with it.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Decoded key-value payload
pub type JsonObject = Map<String, Value>;

/// Broadcast envelope type consumed by real-time client sessions
pub const GROUP_MESSAGE_TYPE: &str = "sensor_message";

/// Payload decoding and schema errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("Invalid {kind} payload: {reason}")]
    Schema { kind: &'static str, reason: String },
}

impl DecodeError {
    fn schema(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Schema {
            kind,
            reason: reason.into(),
        }
    }
}

/// Decode a raw payload into a JSON object
pub fn decode_object(raw: &[u8]) -> Result<JsonObject, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("boolean")),
        Value::Null => Err(DecodeError::NotAnObject("null")),
    }
}

fn decode_schema<T: DeserializeOwned>(
    kind: &'static str,
    payload: &JsonObject,
) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| DecodeError::schema(kind, e.to_string()))
}

fn check_percentage(kind: &'static str, field: &str, value: f64) -> Result<(), DecodeError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(DecodeError::schema(
            kind,
            format!("{field} must be within 0..=100, got {value}"),
        ));
    }
    Ok(())
}

fn check_timestamp(kind: &'static str, timestamp: Option<&str>) -> Result<(), DecodeError> {
    if let Some(ts) = timestamp {
        DateTime::parse_from_rfc3339(ts).map_err(|e| {
            DecodeError::schema(kind, format!("timestamp '{ts}' is not RFC 3339: {e}"))
        })?;
    }
    Ok(())
}

/// A message as delivered by the broker, alive only for the duration of dispatch
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Telemetry reading published on `{namespace}/sensors/{id}/data`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorReading {
    pub fill_level: f64,
    pub battery_level: Option<f64>,
    pub timestamp: Option<String>,
    pub distance_cm: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub signal_strength: Option<i64>,
}

impl SensorReading {
    const KIND: &'static str = "sensor reading";

    pub fn from_object(payload: &JsonObject) -> Result<Self, DecodeError> {
        let reading: Self = decode_schema(Self::KIND, payload)?;
        check_percentage(Self::KIND, "fill_level", reading.fill_level)?;
        if let Some(battery) = reading.battery_level {
            check_percentage(Self::KIND, "battery_level", battery)?;
        }
        check_timestamp(Self::KIND, reading.timestamp.as_deref())?;
        Ok(reading)
    }
}

/// Alert severity reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Alert published on `{namespace}/alerts`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlertEvent {
    pub code: Option<String>,
    pub alert_type: Option<String>,
    pub severity: Option<Severity>,
    pub title: Option<String>,
    pub message: Option<String>,
}

impl AlertEvent {
    const KIND: &'static str = "alert";

    pub fn from_object(payload: &JsonObject) -> Result<Self, DecodeError> {
        decode_schema(Self::KIND, payload)
    }
}

/// Response published by a device on `{namespace}/commands/{id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandResponse {
    pub command: Option<String>,
    pub ack: Option<bool>,
    pub status: Option<String>,
}

impl CommandResponse {
    const KIND: &'static str = "command response";

    pub fn from_object(payload: &JsonObject) -> Result<Self, DecodeError> {
        decode_schema(Self::KIND, payload)
    }
}

/// Device health report published on `{namespace}/sensors/{id}/status`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusReport {
    pub status: Option<String>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<i64>,
}

impl StatusReport {
    const KIND: &'static str = "status report";

    pub fn from_object(payload: &JsonObject) -> Result<Self, DecodeError> {
        let report: Self = decode_schema(Self::KIND, payload)?;
        if let Some(battery) = report.battery_level {
            check_percentage(Self::KIND, "battery_level", battery)?;
        }
        Ok(report)
    }
}

/// Command payload sent to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    pub parameters: JsonObject,
    pub timestamp: DateTime<Utc>,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, parameters: JsonObject) -> Self {
        Self {
            command: command.into(),
            parameters,
            timestamp: Utc::now(),
        }
    }
}

/// Kind of real-time event pushed to client sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SensorUpdate,
    AlertNotification,
    CommandResponse,
    DeviceStatus,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SensorUpdate => "sensor_update",
            EventType::AlertNotification => "alert_notification",
            EventType::CommandResponse => "command_response",
            EventType::DeviceStatus => "device_status",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event created by a handler and forwarded once to the broadcast group.
///
/// The timestamp is fixed at creation and mirrored into `data.timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutEvent {
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl FanOutEvent {
    pub fn new(event_type: EventType, mut data: JsonObject) -> Self {
        let timestamp = Utc::now();
        data.insert(
            "timestamp".to_string(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        Self {
            event_type,
            data: Value::Object(data),
            timestamp,
        }
    }

    /// `{"type": <event type>, "data": {...}}`
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": self.event_type.as_str(),
            "data": self.data,
        })
    }
}

/// Message delivered to the broadcast group:
/// `{"type": "sensor_message", "event": <event type>, "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub event: EventType,
    pub data: Value,
}

impl From<FanOutEvent> for GroupMessage {
    fn from(event: FanOutEvent) -> Self {
        Self {
            message_type: GROUP_MESSAGE_TYPE.to_string(),
            event: event.event_type,
            data: event.data,
        }
    }
}
