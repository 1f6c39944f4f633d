//! Webhook task queue backend
//!
//! Tasks are buffered in a bounded channel and POSTed as JSON by a background
//! worker, so `enqueue` never waits on the network. Delivery failures are logged
//! and not retried.

use super::{try_send, TaskQueue, TaskQueueError, TaskRequest};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookTaskQueue {
    sender: mpsc::Sender<TaskRequest>,
    endpoint: Url,
    _worker: JoinHandle<()>,
}

impl WebhookTaskQueue {
    /// Start the delivery worker. Must be called inside a Tokio runtime.
    pub fn spawn(endpoint: Url, capacity: usize) -> Result<Self, TaskQueueError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TaskQueueError::Backend(format!("HTTP client setup failed: {e}")))?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(deliver_tasks(client, endpoint.clone(), receiver));

        Ok(Self {
            sender,
            endpoint,
            _worker: worker,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl TaskQueue for WebhookTaskQueue {
    fn backend(&self) -> &'static str {
        "webhook"
    }

    fn enqueue(&self, task: TaskRequest) -> Result<(), TaskQueueError> {
        try_send(&self.sender, task)
    }
}

async fn deliver_tasks(
    client: reqwest::Client,
    endpoint: Url,
    mut receiver: mpsc::Receiver<TaskRequest>,
) {
    while let Some(task) = receiver.recv().await {
        match client.post(endpoint.clone()).json(&task).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(task_id = %task.id, task = %task.name, "Task delivered");
            }
            Ok(response) => {
                warn!(
                    task_id = %task.id,
                    task = %task.name,
                    status = %response.status(),
                    "Task endpoint rejected task"
                );
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    task = %task.name,
                    error = %e,
                    "Task delivery failed"
                );
            }
        }
    }
    debug!("Webhook task worker stopped");
}
