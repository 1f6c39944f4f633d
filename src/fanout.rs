//! Real-time fan-out to connected client sessions
//!
//! Every handler forwards its event to one named broadcast group. Sends never
//! block and never fail: with no subscribers the event is simply dropped.
//! Slow subscribers lag and lose the oldest events rather than applying
//! backpressure to the receive loop.

use crate::observability::metrics::metrics;
use crate::protocol::{FanOutEvent, GroupMessage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast group consumed by dashboard sessions
pub const DEFAULT_GROUP: &str = "sensor_updates";

/// Handle onto one broadcast group. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FanOutBridge {
    group: Arc<str>,
    sender: broadcast::Sender<GroupMessage>,
}

impl FanOutBridge {
    pub fn new(group: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            group: Arc::from(group.into()),
            sender,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Join the group; the receiver sees every event sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<GroupMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Wrap the event in the group envelope and deliver it to all current
    /// subscribers. Returns how many subscribers received it.
    pub fn send_update(&self, event: FanOutEvent) -> usize {
        let event_type = event.event_type;
        let receivers = match self.sender.send(GroupMessage::from(event)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(
                    group = %self.group,
                    event = %event_type,
                    "No subscribers for fan-out event"
                );
                0
            }
        };
        metrics().record_fanout(receivers);
        receivers
    }
}

impl Default for FanOutBridge {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP, 256)
    }
}
