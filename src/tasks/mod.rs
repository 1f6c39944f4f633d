//! Hand-off of durable processing work to an external task queue
//!
//! Handlers only ever call [`TaskQueue::enqueue`], which is synchronous and must
//! never wait on downstream work. Backends:
//!
//! - [`ChannelTaskQueue`] - bounded in-process channel, the consumer owns the receiver
//! - [`WebhookTaskQueue`] - background worker POSTing each task as JSON
//! - [`TracingTaskQueue`] - logs tasks; useful when no worker is deployed

pub mod webhook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::protocol::JsonObject;

pub use webhook::WebhookTaskQueue;

/// Tasks understood by the downstream worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    ProcessSensorReading,
    ProcessSensorAlert,
    UpdateDeviceStatus,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::ProcessSensorReading => "process_sensor_reading",
            TaskName::ProcessSensorAlert => "process_sensor_alert",
            TaskName::UpdateDeviceStatus => "update_device_status",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fire-and-forget unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: Uuid,
    pub name: TaskName,
    pub args: Vec<Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(name: TaskName, args: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            args,
            enqueued_at: Utc::now(),
        }
    }

    /// `process_sensor_reading(sensor_id, payload)`
    pub fn process_sensor_reading(sensor_id: &str, payload: JsonObject) -> Self {
        Self::new(
            TaskName::ProcessSensorReading,
            vec![Value::String(sensor_id.to_string()), Value::Object(payload)],
        )
    }

    /// `process_sensor_alert(payload)`
    pub fn process_sensor_alert(payload: JsonObject) -> Self {
        Self::new(TaskName::ProcessSensorAlert, vec![Value::Object(payload)])
    }

    /// `update_device_status(sensor_id, payload)`
    pub fn update_device_status(sensor_id: &str, payload: JsonObject) -> Self {
        Self::new(
            TaskName::UpdateDeviceStatus,
            vec![Value::String(sensor_id.to_string()), Value::Object(payload)],
        )
    }
}

/// Task hand-off errors
#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("Task queue is full, dropped {0}")]
    Full(TaskName),
    #[error("Task queue is closed, dropped {0}")]
    Closed(TaskName),
    #[error("Task queue backend unavailable: {0}")]
    Backend(String),
}

/// External task queue boundary
pub trait TaskQueue: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// Submit a task without waiting for it to be processed
    fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError>;
}

fn try_send(
    sender: &mpsc::Sender<TaskRequest>,
    task: TaskRequest,
) -> Result<(), TaskQueueError> {
    let name = task.name;
    sender.try_send(task).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => TaskQueueError::Full(name),
        mpsc::error::TrySendError::Closed(_) => TaskQueueError::Closed(name),
    })
}

/// Bounded in-process queue
#[derive(Debug, Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::Sender<TaskRequest>,
}

impl ChannelTaskQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TaskRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl TaskQueue for ChannelTaskQueue {
    fn backend(&self) -> &'static str {
        "channel"
    }

    fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError> {
        try_send(&self.sender, task)
    }
}

/// Logs every task instead of delivering it
#[derive(Debug, Default, Clone)]
pub struct TracingTaskQueue;

impl TaskQueue for TracingTaskQueue {
    fn backend(&self) -> &'static str {
        "tracing"
    }

    fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError> {
        info!(
            task_id = %task.id,
            task = %task.name,
            args = %serde_json::Value::Array(task.args),
            "Task enqueued"
        );
        Ok(())
    }
}
