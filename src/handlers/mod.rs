//! Message handlers for each inbound message kind
//!
//! Handlers are stateless: each one validates the payload for its kind, hands
//! durable work to the task queue and emits exactly one fan-out event. The task
//! queue and the fan-out bridge are independent paths, so a failed enqueue still
//! lets the real-time event through before the fault is reported to the router.

pub mod alert;
pub mod command;
pub mod sensor;
pub mod status;

use crate::fanout::FanOutBridge;
use crate::observability::metrics::metrics;
use crate::protocol::{topic_segment, validate_device_id};
use crate::routing::{HandlerError, MessageHandler};
use crate::tasks::{TaskQueue, TaskQueueError, TaskRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

pub use alert::AlertHandler;
pub use command::CommandResponseHandler;
pub use sensor::SensorDataHandler;
pub use status::DeviceStatusHandler;

/// Device id segment for single-level namespaces: `{namespace}/sensors/{id}/data`
pub const DEFAULT_DEVICE_SEGMENT: usize = 2;

/// Shared collaborators handed to every handler
#[derive(Clone)]
pub struct HandlerContext {
    pub tasks: Arc<dyn TaskQueue>,
    pub fanout: FanOutBridge,
    pub device_segment: usize,
}

impl HandlerContext {
    pub fn new(tasks: Arc<dyn TaskQueue>, fanout: FanOutBridge) -> Self {
        Self {
            tasks,
            fanout,
            device_segment: DEFAULT_DEVICE_SEGMENT,
        }
    }

    pub fn with_device_segment(mut self, segment: usize) -> Self {
        self.device_segment = segment;
        self
    }

    /// Extract and validate the device identifier from a topic
    pub(crate) fn device_id<'a>(&self, topic: &'a str) -> Result<&'a str, HandlerError> {
        let device_id =
            topic_segment(topic, self.device_segment).ok_or_else(|| {
                HandlerError::MissingDeviceId {
                    topic: topic.to_string(),
                    segment: self.device_segment,
                }
            })?;
        validate_device_id(device_id)?;
        Ok(device_id)
    }

    /// Hand a task to the queue without waiting on it
    pub(crate) fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError> {
        let name = task.name;
        match self.tasks.enqueue(task) {
            Ok(()) => {
                debug!(task = %name, backend = self.tasks.backend(), "Task handed off");
                metrics().record_task_enqueued();
                Ok(())
            }
            Err(e) => {
                error!(
                    task = %name,
                    backend = self.tasks.backend(),
                    error = %e,
                    "Failed to enqueue task"
                );
                metrics().record_task_enqueue_failure();
                Err(e)
            }
        }
    }
}

/// Handler kinds that can be bound to a topic pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    SensorData,
    Alerts,
    Commands,
    Status,
}

impl HandlerKind {
    /// Whether the handler takes a device id from its topic
    pub fn reads_device_id(&self) -> bool {
        !matches!(self, HandlerKind::Alerts)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::SensorData => "sensor_data",
            HandlerKind::Alerts => "alerts",
            HandlerKind::Commands => "commands",
            HandlerKind::Status => "status",
        }
    }

    /// Instantiate the handler for this kind
    pub fn build(&self, context: &HandlerContext) -> Arc<dyn MessageHandler> {
        let context = context.clone();
        match self {
            HandlerKind::SensorData => Arc::new(SensorDataHandler::new(context)),
            HandlerKind::Alerts => Arc::new(AlertHandler::new(context)),
            HandlerKind::Commands => Arc::new(CommandResponseHandler::new(context)),
            HandlerKind::Status => Arc::new(DeviceStatusHandler::new(context)),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTaskQueue;

    fn context() -> HandlerContext {
        HandlerContext::new(Arc::new(RecordingTaskQueue::new()), FanOutBridge::default())
    }

    #[test]
    fn test_device_id_extraction() {
        let ctx = context();
        assert_eq!(ctx.device_id("demo/sensors/abc123/data").unwrap(), "abc123");
        assert_eq!(ctx.device_id("demo/commands/xyz789").unwrap(), "xyz789");
    }

    #[test]
    fn test_device_id_missing() {
        let ctx = context();
        assert!(matches!(
            ctx.device_id("demo/alerts"),
            Err(HandlerError::MissingDeviceId { segment: 2, .. })
        ));
        assert!(ctx.device_id("demo/sensors//data").is_err());
    }

    #[test]
    fn test_device_segment_is_configurable() {
        let ctx = context().with_device_segment(1);
        assert_eq!(ctx.device_id("devices/d-1/telemetry").unwrap(), "d-1");
    }

    #[test]
    fn test_handler_kind_names() {
        let ctx = context();
        for kind in [
            HandlerKind::SensorData,
            HandlerKind::Alerts,
            HandlerKind::Commands,
            HandlerKind::Status,
        ] {
            assert_eq!(kind.build(&ctx).name(), kind.as_str());
        }
    }

    #[test]
    fn test_only_alerts_have_no_device_id() {
        assert!(HandlerKind::SensorData.reads_device_id());
        assert!(HandlerKind::Commands.reads_device_id());
        assert!(HandlerKind::Status.reads_device_id());
        assert!(!HandlerKind::Alerts.reads_device_id());
    }

    #[test]
    fn test_handler_kind_serde() {
        let kind: HandlerKind = serde_json::from_str("\"sensor_data\"").unwrap();
        assert_eq!(kind, HandlerKind::SensorData);
    }
}
