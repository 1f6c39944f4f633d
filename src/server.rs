//! HTTP surface: WebSocket fan-out stream plus health and metrics endpoints
//!
//! - `GET /ws` upgrades to a WebSocket session that receives every message of
//!   the bridge's broadcast group as a JSON text frame
//! - `GET /health` reports broker connectivity (503 while not connected)
//! - `GET /ready` and `GET /live` are orchestration probes
//! - `GET /metrics` exports the global [`MetricsSnapshot`](crate::observability::MetricsSnapshot)
//! - `GET /` lists the endpoints

use crate::fanout::FanOutBridge;
use crate::observability::metrics::metrics;
use crate::transport::mqtt::ConnectionState;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter;

/// HTTP and WebSocket server for dashboards and orchestration probes
#[derive(Clone)]
pub struct RelayServer {
    port: u16,
    fanout: FanOutBridge,
    state: watch::Receiver<ConnectionState>,
}

impl RelayServer {
    pub fn new(port: u16, fanout: FanOutBridge, state: watch::Receiver<ConnectionState>) -> Self {
        Self {
            port,
            fanout,
            state,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, usable directly with `warp::test`
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let fanout = self.fanout.clone();
        let ws_route = warp::path("ws")
            .and(warp::path::end())
            .and(warp::ws())
            .map(move |ws: Ws| {
                let fanout = fanout.clone();
                ws.on_upgrade(move |socket| stream_group(socket, fanout))
            });

        let health_state = self.state.clone();
        let health_fanout = self.fanout.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let status = health_status(*health_state.borrow(), &health_fanout);
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&status), code)
            });

        let ready_state = self.state.clone();
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = *ready_state.borrow() == ConnectionState::Connected;
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/ws", "WebSocket stream of fan-out events"),
                ("/health", "Broker connectivity and fan-out status"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
                ("/metrics", "Routing, task, fan-out and MQTT metrics"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&json!({ "endpoints": endpoints }))
        });

        ws_route
            .or(health_route)
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind to the configured port on all interfaces and serve until `shutdown`
    /// resolves. Returns the bound address and the server task.
    pub fn spawn<F>(&self, shutdown: F) -> Result<(SocketAddr, JoinHandle<()>), warp::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(address = %bound, group = %self.fanout.group(), "HTTP server listening");
        Ok((bound, tokio::spawn(server)))
    }
}

/// Forward broadcast group messages to one WebSocket session until either side closes
async fn stream_group(socket: WebSocket, fanout: FanOutBridge) {
    let session = Uuid::new_v4();
    let mut updates = fanout.subscribe();
    let (mut sink, mut incoming) = socket.split();
    info!(session = %session, group = %fanout.group(), "WebSocket session joined group");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(session = %session, error = %e, "Failed to serialize group message");
                            continue;
                        }
                    };
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %session, skipped, "WebSocket session lagged behind fan-out");
                    metrics().record_fanout_lagged(skipped);
                    let notice = json!({ "type": "lagged", "skipped": skipped });
                    if sink.send(Message::text(notice.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            frame = incoming.next() => match frame {
                Some(Ok(frame)) if frame.is_close() => break,
                // Inbound frames carry nothing for us
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session, error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    info!(session = %session, "WebSocket session left group");
}

fn health_status(state: ConnectionState, fanout: &FanOutBridge) -> HealthStatus {
    let now = current_timestamp();
    let connected = state == ConnectionState::Connected;

    let mut checks = HashMap::new();
    checks.insert(
        "mqtt".to_string(),
        HealthCheck {
            status: if connected { "healthy" } else { "unhealthy" }.to_string(),
            message: Some(format!("Broker connection {state}")),
            last_check: now,
        },
    );
    checks.insert(
        "fanout".to_string(),
        HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!(
                "{} session(s) in group '{}'",
                fanout.subscriber_count(),
                fanout.group()
            )),
            last_check: now,
        },
    );

    let healthy = checks.values().all(|check| check.status == "healthy");
    HealthStatus {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: now,
        uptime_seconds: metrics().get_metrics().uptime_seconds,
        checks,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_follows_connection_state() {
        let fanout = FanOutBridge::default();

        let status = health_status(ConnectionState::Connected, &fanout);
        assert_eq!(status.status, "healthy");
        assert!(status.checks.contains_key("mqtt"));
        assert!(status.checks.contains_key("fanout"));

        let status = health_status(ConnectionState::Connecting, &fanout);
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks["mqtt"].status, "unhealthy");
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let (_tx, state) = watch::channel(ConnectionState::Disconnected);
        let server = RelayServer::new(0, FanOutBridge::default(), state);

        let response = warp::test::request()
            .method("GET")
            .path("/live")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_tracks_state_changes() {
        let (tx, state) = watch::channel(ConnectionState::Disconnected);
        let server = RelayServer::new(0, FanOutBridge::default(), state);
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(ConnectionState::Connected);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
