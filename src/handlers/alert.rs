//! Alert handler (`{namespace}/alerts`)

use super::HandlerContext;
use crate::protocol::{AlertEvent, EventType, FanOutEvent, JsonObject};
use crate::routing::{HandlerError, MessageHandler};
use crate::tasks::TaskRequest;
use serde_json::Value;
use tracing::info;

pub struct AlertHandler {
    context: HandlerContext,
}

impl AlertHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

impl MessageHandler for AlertHandler {
    fn name(&self) -> &str {
        "alerts"
    }

    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError> {
        let alert = AlertEvent::from_object(payload)?;

        info!(
            topic = %topic,
            code = alert.code.as_deref().unwrap_or("unknown"),
            severity = ?alert.severity,
            "Received alert"
        );

        let queued = self
            .context
            .enqueue(TaskRequest::process_sensor_alert(payload.clone()));

        let mut data = JsonObject::new();
        data.insert("alert".to_string(), Value::Object(payload.clone()));
        self.context
            .fanout
            .send_update(FanOutEvent::new(EventType::AlertNotification, data));

        queued.map_err(HandlerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanOutBridge;
    use crate::tasks::TaskName;
    use crate::testing::RecordingTaskQueue;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_alert_is_enqueued_and_fanned_out() {
        let tasks = Arc::new(RecordingTaskQueue::new());
        let fanout = FanOutBridge::new("sensor_updates", 8);
        let mut rx = fanout.subscribe();
        let handler = AlertHandler::new(HandlerContext::new(tasks.clone(), fanout));

        let payload = json!({"code": "BIN_FULL"}).as_object().cloned().unwrap();
        handler.handle("demo/alerts", &payload).unwrap();

        let queued = tasks.tasks();
        assert_eq!(queued[0].name, TaskName::ProcessSensorAlert);
        assert_eq!(queued[0].args, vec![json!({"code": "BIN_FULL"})]);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.event, EventType::AlertNotification);
        assert_eq!(message.data["alert"], json!({"code": "BIN_FULL"}));
    }

    #[test]
    fn test_unknown_severity_is_rejected() {
        let tasks = Arc::new(RecordingTaskQueue::new());
        let handler = AlertHandler::new(HandlerContext::new(tasks.clone(), FanOutBridge::default()));

        let payload = json!({"severity": "apocalyptic"}).as_object().cloned().unwrap();
        assert!(handler.handle("demo/alerts", &payload).is_err());
        assert!(tasks.tasks().is_empty());
    }
}
