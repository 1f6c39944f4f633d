//! Mock implementations for testing
//!
//! Provides a mock Transport, recording and faulty message handlers and a
//! recording task queue so routing, handlers and publishing can be exercised
//! without a broker.

use crate::protocol::JsonObject;
use crate::routing::{HandlerError, MessageHandler};
use crate::tasks::{TaskQueue, TaskQueueError, TaskRequest};
use crate::transport::mqtt::{ConnectionState, QoS};
use crate::transport::{PublishError, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// `(topic, payload, qos)` as handed to the transport
pub type PublishedMessage = (String, Vec<u8>, QoS);

/// Mock transport recording every publish
#[derive(Debug)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub should_fail: bool,
    connected: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published_messages: Arc::default(),
            should_fail: false,
            connected: AtomicBool::new(true),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose broker rejects every publish
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        let transport = Self::default();
        transport.set_connected(false);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut messages) = self.published_messages.lock() {
            messages.clear();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected {
                state: ConnectionState::Disconnected,
            });
        }
        if self.should_fail {
            return Err(PublishError::Rejected("Mock publish failure".to_string()));
        }

        if let Ok(mut messages) = self.published_messages.lock() {
            messages.push((topic.to_string(), payload, qos));
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Handler recording every `(topic, payload)` it is given
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    calls: Mutex<Vec<(String, JsonObject)>>,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, JsonObject)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

impl MessageHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((topic.to_string(), payload.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum FaultMode {
    Error,
    Panic,
}

/// Handler that always fails, either by returning an error or by panicking
#[derive(Debug)]
pub struct FaultyHandler {
    name: String,
    mode: FaultMode,
}

impl FaultyHandler {
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: FaultMode::Error,
        }
    }

    pub fn panicking(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: FaultMode::Panic,
        }
    }
}

impl MessageHandler for FaultyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, topic: &str, _payload: &JsonObject) -> Result<(), HandlerError> {
        match self.mode {
            FaultMode::Error => Err(HandlerError::Failed(format!("mock failure on {topic}"))),
            FaultMode::Panic => panic!("mock handler panic on {topic}"),
        }
    }
}

/// Task queue keeping every accepted task in memory
#[derive(Debug, Default)]
pub struct RecordingTaskQueue {
    tasks: Mutex<Vec<TaskRequest>>,
    reject: bool,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that refuses every task as if it were full
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn tasks(&self) -> Vec<TaskRequest> {
        self.tasks
            .lock()
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }
}

impl TaskQueue for RecordingTaskQueue {
    fn backend(&self) -> &'static str {
        "recording"
    }

    fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError> {
        if self.reject {
            return Err(TaskQueueError::Full(task.name));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(())
    }
}
