//! Device status handler (`{namespace}/sensors/{id}/status`)

use super::HandlerContext;
use crate::protocol::{EventType, FanOutEvent, JsonObject, StatusReport};
use crate::routing::{HandlerError, MessageHandler};
use crate::tasks::TaskRequest;
use serde_json::Value;
use tracing::debug;

pub struct DeviceStatusHandler {
    context: HandlerContext,
}

impl DeviceStatusHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

impl MessageHandler for DeviceStatusHandler {
    fn name(&self) -> &str {
        "status"
    }

    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError> {
        let sensor_id = self.context.device_id(topic)?;
        let report = StatusReport::from_object(payload)?;

        debug!(
            sensor_id = %sensor_id,
            status = report.status.as_deref().unwrap_or("unknown"),
            battery_level = ?report.battery_level,
            "Received device status"
        );

        let queued = self
            .context
            .enqueue(TaskRequest::update_device_status(sensor_id, payload.clone()));

        let mut data = JsonObject::new();
        data.insert("sensor_id".to_string(), Value::String(sensor_id.to_string()));
        data.insert("status".to_string(), Value::Object(payload.clone()));
        self.context
            .fanout
            .send_update(FanOutEvent::new(EventType::DeviceStatus, data));

        queued.map_err(HandlerError::from)
    }
}
