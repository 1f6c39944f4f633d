//! Sensor telemetry handler (`{namespace}/sensors/{id}/data`)

use super::HandlerContext;
use crate::protocol::{EventType, FanOutEvent, JsonObject, SensorReading};
use crate::routing::{HandlerError, MessageHandler};
use crate::tasks::TaskRequest;
use serde_json::Value;
use tracing::debug;

pub struct SensorDataHandler {
    context: HandlerContext,
}

impl SensorDataHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

impl MessageHandler for SensorDataHandler {
    fn name(&self) -> &str {
        "sensor_data"
    }

    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError> {
        let sensor_id = self.context.device_id(topic)?;
        let reading = SensorReading::from_object(payload)?;

        debug!(
            sensor_id = %sensor_id,
            fill_level = reading.fill_level,
            "Received sensor reading"
        );

        let queued = self
            .context
            .enqueue(TaskRequest::process_sensor_reading(sensor_id, payload.clone()));

        let mut data = JsonObject::new();
        data.insert("sensor_id".to_string(), Value::String(sensor_id.to_string()));
        data.insert("data".to_string(), Value::Object(payload.clone()));
        self.context
            .fanout
            .send_update(FanOutEvent::new(EventType::SensorUpdate, data));

        queued.map_err(HandlerError::from)
    }
}
