//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! routing, task hand-off, fan-out and MQTT transport statistics.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Routing (atomic for high frequency)
    messages_received: AtomicU64,
    messages_routed: AtomicU64,
    decode_failures: AtomicU64,
    unroutable_messages: AtomicU64,
    handler_faults: AtomicU64,
    messages_dropped_during_shutdown: AtomicU64,

    // Task hand-off
    tasks_enqueued: AtomicU64,
    task_enqueue_failures: AtomicU64,

    // Fan-out
    fanout_events: AtomicU64,
    fanout_events_unobserved: AtomicU64,
    fanout_deliveries: AtomicU64,
    fanout_lagged: AtomicU64,

    // MQTT
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    subscription_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    // Dispatch latency (mutex protected for complex operations)
    dispatch_times: Mutex<Vec<u64>>, // in microseconds

    // Per-handler statistics
    handler_stats: Mutex<HashMap<String, HandlerStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            unroutable_messages: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            messages_dropped_during_shutdown: AtomicU64::new(0),
            tasks_enqueued: AtomicU64::new(0),
            task_enqueue_failures: AtomicU64::new(0),
            fanout_events: AtomicU64::new(0),
            fanout_events_unobserved: AtomicU64::new(0),
            fanout_deliveries: AtomicU64::new(0),
            fanout_lagged: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            subscription_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            handler_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Routing metrics
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unroutable(&self) {
        self.unroutable_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self, handler: &str, duration: Duration) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.record_dispatch(handler, duration, true);
    }

    pub fn record_handler_fault(&self, handler: &str, duration: Duration) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
        self.record_dispatch(handler, duration, false);
    }

    pub fn record_dropped_during_shutdown(&self) {
        self.messages_dropped_during_shutdown
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatch(&self, handler: &str, duration: Duration, success: bool) {
        if let Ok(mut times) = self.dispatch_times.lock() {
            times.push(duration.as_micros() as u64);
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }

        if let Ok(mut stats) = self.handler_stats.lock() {
            let entry = stats.entry(handler.to_string()).or_default();
            entry.dispatched += 1;
            if !success {
                entry.faults += 1;
            }
            entry.last_dispatch = current_timestamp();
        }
    }

    // Task hand-off metrics
    pub fn record_task_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_enqueue_failure(&self) {
        self.task_enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Fan-out metrics
    pub fn record_fanout(&self, receivers: usize) {
        self.fanout_events.fetch_add(1, Ordering::Relaxed);
        if receivers == 0 {
            self.fanout_events_unobserved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fanout_deliveries
                .fetch_add(receivers as u64, Ordering::Relaxed);
        }
    }

    pub fn record_fanout_lagged(&self, skipped: u64) {
        self.fanout_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_disconnected();
    }

    pub fn mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_subscription_failed(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all counters (test support)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_routed,
            &self.decode_failures,
            &self.unroutable_messages,
            &self.handler_faults,
            &self.messages_dropped_during_shutdown,
            &self.tasks_enqueued,
            &self.task_enqueue_failures,
            &self.fanout_events,
            &self.fanout_events_unobserved,
            &self.fanout_deliveries,
            &self.fanout_lagged,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.subscription_failures,
            &self.messages_published,
            &self.publish_failures,
            &self.connection_start_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.dispatch_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.handler_stats.lock() {
            stats.clear();
        }
    }

    /// Dispatch latency statistics: (avg, p50, p95, p99) in microseconds
    fn dispatch_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.dispatch_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let avg = times.iter().sum::<u64>() as f64 / times.len() as f64;
        let mut sorted = times.clone();
        sorted.sort_unstable();

        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn handler_snapshots(&self) -> HashMap<String, HandlerStatsSnapshot> {
        let Ok(stats) = self.handler_stats.lock() else {
            return HashMap::new();
        };
        stats
            .iter()
            .map(|(name, stats)| {
                let success_rate = if stats.dispatched > 0 {
                    (stats.dispatched - stats.faults) as f64 / stats.dispatched as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    HandlerStatsSnapshot {
                        dispatched: stats.dispatched,
                        faults: stats.faults,
                        success_rate,
                        last_dispatch: stats.last_dispatch,
                    },
                )
            })
            .collect()
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.dispatch_time_statistics();

        MetricsSnapshot {
            routing: RoutingMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_routed: self.messages_routed.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                unroutable_messages: self.unroutable_messages.load(Ordering::Relaxed),
                handler_faults: self.handler_faults.load(Ordering::Relaxed),
                dropped_during_shutdown: self
                    .messages_dropped_during_shutdown
                    .load(Ordering::Relaxed),
                avg_dispatch_time_us: avg,
                dispatch_time_p50_us: p50,
                dispatch_time_p95_us: p95,
                dispatch_time_p99_us: p99,
                handlers: self.handler_snapshots(),
            },
            tasks: TaskMetrics {
                enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
                enqueue_failures: self.task_enqueue_failures.load(Ordering::Relaxed),
            },
            fanout: FanOutMetrics {
                events: self.fanout_events.load(Ordering::Relaxed),
                events_unobserved: self.fanout_events_unobserved.load(Ordering::Relaxed),
                deliveries: self.fanout_deliveries.load(Ordering::Relaxed),
                lagged: self.fanout_lagged.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct HandlerStats {
    dispatched: u64,
    faults: u64,
    last_dispatch: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub routing: RoutingMetrics,
    pub tasks: TaskMetrics,
    pub fanout: FanOutMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub messages_received: u64,
    pub messages_routed: u64,
    pub decode_failures: u64,
    pub unroutable_messages: u64,
    pub handler_faults: u64,
    pub dropped_during_shutdown: u64,
    pub avg_dispatch_time_us: f64,
    pub dispatch_time_p50_us: f64,
    pub dispatch_time_p95_us: f64,
    pub dispatch_time_p99_us: f64,
    pub handlers: HashMap<String, HandlerStatsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct HandlerStatsSnapshot {
    pub dispatched: u64,
    pub faults: u64,
    pub success_rate: f64,
    pub last_dispatch: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub enqueued: u64,
    pub enqueue_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct FanOutMetrics {
    pub events: u64,
    pub events_unobserved: u64,
    pub deliveries: u64,
    pub lagged: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub subscription_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
