//! Fan-out bridge delivery semantics

use sensor_relay::fanout::FanOutBridge;
use sensor_relay::protocol::{EventType, FanOutEvent, JsonObject};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn event(sensor_id: &str) -> FanOutEvent {
    let mut data = JsonObject::new();
    data.insert("sensor_id".to_string(), Value::String(sensor_id.to_string()));
    FanOutEvent::new(EventType::SensorUpdate, data)
}

#[test]
fn test_send_without_subscribers_is_dropped_silently() {
    let bridge = FanOutBridge::new("sensor_updates", 4);
    assert_eq!(bridge.subscriber_count(), 0);
    assert_eq!(bridge.send_update(event("bin-1")), 0);
}

#[tokio::test]
async fn test_every_subscriber_receives_each_event() {
    let bridge = FanOutBridge::new("sensor_updates", 4);
    let mut first = bridge.subscribe();
    let mut second = bridge.clone().subscribe();

    assert_eq!(bridge.send_update(event("bin-1")), 2);

    for receiver in [&mut first, &mut second] {
        let message = receiver.recv().await.unwrap();
        assert_eq!(message.event, EventType::SensorUpdate);
        assert_eq!(message.data["sensor_id"], json!("bin-1"));
    }
}

#[test]
fn test_late_subscriber_misses_earlier_events() {
    let bridge = FanOutBridge::new("sensor_updates", 4);
    let _early = bridge.subscribe();
    bridge.send_update(event("bin-1"));

    let mut late = bridge.subscribe();
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_slow_subscriber_lags_without_blocking_sender() {
    let bridge = FanOutBridge::new("sensor_updates", 2);
    let mut slow = bridge.subscribe();

    for i in 0..5 {
        bridge.send_update(event(&format!("bin-{i}")));
    }

    assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
    let message = slow.recv().await.unwrap();
    assert_eq!(message.data["sensor_id"], json!("bin-3"));
}

#[test]
fn test_group_name_is_kept() {
    let bridge = FanOutBridge::new("dashboard", 8);
    assert_eq!(bridge.group(), "dashboard");
    assert_eq!(FanOutBridge::default().group(), "sensor_updates");
}
