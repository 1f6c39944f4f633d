//! Command response handler (`{namespace}/commands/{id}`)
//!
//! Responses are only logged and fanned out; no task is enqueued.

use super::HandlerContext;
use crate::protocol::{CommandResponse, EventType, FanOutEvent, JsonObject};
use crate::routing::{HandlerError, MessageHandler};
use serde_json::Value;
use tracing::info;

pub struct CommandResponseHandler {
    context: HandlerContext,
}

impl CommandResponseHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

impl MessageHandler for CommandResponseHandler {
    fn name(&self) -> &str {
        "commands"
    }

    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError> {
        let sensor_id = self.context.device_id(topic)?;
        let response = CommandResponse::from_object(payload)?;

        info!(
            sensor_id = %sensor_id,
            command = response.command.as_deref().unwrap_or("unknown"),
            ack = ?response.ack,
            response = %serde_json::Value::Object(payload.clone()),
            "Command response received"
        );

        let mut data = JsonObject::new();
        data.insert("sensor_id".to_string(), Value::String(sensor_id.to_string()));
        data.insert("response".to_string(), Value::Object(payload.clone()));
        self.context
            .fanout
            .send_update(FanOutEvent::new(EventType::CommandResponse, data));

        Ok(())
    }
}
