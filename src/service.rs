//! Service wiring
//!
//! [`RelayService`] is the explicit owner of everything a running relay needs:
//! the task queue, the fan-out bridge, the router built from the configured
//! topic bindings, the connection manager and the outbound publisher. Whoever
//! constructs it controls its lifecycle with `start`/`stop`.

use crate::config::{RelayConfig, TaskBackend, TopicBinding};
use crate::error::RelayResult;
use crate::fanout::FanOutBridge;
use crate::handlers::HandlerContext;
use crate::routing::TopicRouter;
use crate::server::RelayServer;
use crate::tasks::{TaskQueue, TracingTaskQueue, WebhookTaskQueue};
use crate::transport::mqtt::{ConnectionManager, ConnectionState};
use crate::transport::OutboundPublisher;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Build the task queue selected by `[tasks]`.
///
/// The webhook backend spawns its delivery worker, so this must run inside a
/// Tokio runtime.
pub fn task_queue_from_config(config: &RelayConfig) -> RelayResult<Arc<dyn TaskQueue>> {
    let queue: Arc<dyn TaskQueue> = match config.tasks.backend {
        TaskBackend::Tracing => Arc::new(TracingTaskQueue),
        TaskBackend::Webhook => Arc::new(WebhookTaskQueue::spawn(
            config.webhook_url()?,
            config.tasks.queue_capacity,
        )?),
    };
    info!(backend = queue.backend(), "Task queue ready");
    Ok(queue)
}

/// Register one handler per binding, preserving binding order.
///
/// Each handler reads its device id from the segment its own pattern marks
/// with `+`.
pub fn build_router(bindings: &[TopicBinding], context: &HandlerContext) -> TopicRouter {
    bindings.iter().fold(TopicRouter::new(), |router, binding| {
        let context = match binding.device_segment {
            Some(segment) => context.clone().with_device_segment(segment),
            None => context.clone(),
        };
        router.with_route(binding.pattern.clone(), binding.handler.build(&context))
    })
}

/// A fully wired relay instance
pub struct RelayService {
    config: RelayConfig,
    fanout: FanOutBridge,
    manager: ConnectionManager,
    publisher: OutboundPublisher,
}

impl RelayService {
    /// Wire the service using the task backend named in the configuration
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let tasks = task_queue_from_config(&config)?;
        Self::with_task_queue(config, tasks)
    }

    /// Wire the service around an existing task queue
    pub fn with_task_queue(config: RelayConfig, tasks: Arc<dyn TaskQueue>) -> RelayResult<Self> {
        let broker = config.broker_config()?;
        let fanout = FanOutBridge::new(config.fanout.group.clone(), config.fanout.capacity);
        let context = HandlerContext::new(tasks, fanout.clone());

        let router = Arc::new(build_router(broker.bindings(), &context));
        for binding in broker.bindings() {
            info!(pattern = %binding.pattern, handler = %binding.handler, "Route registered");
        }

        let manager = ConnectionManager::new(broker, router);
        let publisher = manager.publisher(config.topic_builder());

        Ok(Self {
            config,
            fanout,
            manager,
            publisher,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn fanout(&self) -> &FanOutBridge {
        &self.fanout
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        self.manager.router()
    }

    pub fn publisher(&self) -> &OutboundPublisher {
        &self.publisher
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_watch()
    }

    /// HTTP surface bound to this service's fan-out group and connection state
    pub fn server(&self) -> RelayServer {
        RelayServer::new(self.config.server.port, self.fanout.clone(), self.state_watch())
    }

    /// Connect to the broker and start dispatching
    pub async fn start(&mut self) -> RelayResult<()> {
        self.manager.connect().await?;
        Ok(())
    }

    /// Disconnect from the broker. Safe to call repeatedly.
    pub async fn stop(&mut self) -> RelayResult<()> {
        self.manager.disconnect().await?;
        Ok(())
    }

    /// Resolves once the connection is no longer established
    pub fn connection_lost(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state_watch();
        async move {
            let _ = state
                .wait_for(|state| *state != ConnectionState::Connected)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use crate::tasks::TaskName;
    use crate::testing::RecordingTaskQueue;

    fn service() -> (RelayService, Arc<RecordingTaskQueue>) {
        let tasks = Arc::new(RecordingTaskQueue::new());
        let service = RelayService::with_task_queue(RelayConfig::default(), tasks.clone()).unwrap();
        (service, tasks)
    }

    #[tokio::test]
    async fn test_router_built_from_default_bindings() {
        let (service, _) = service();
        let router = service.router();

        assert_eq!(router.len(), 4);
        assert_eq!(router.resolve("waste-wise/sensors/bin-1/data"), Some("sensor_data"));
        assert_eq!(router.resolve("waste-wise/alerts"), Some("alerts"));
        assert_eq!(router.resolve("waste-wise/commands/bin-1"), Some("commands"));
        assert_eq!(router.resolve("waste-wise/sensors/bin-1/status"), Some("status"));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_tasks_and_fanout() {
        let (service, tasks) = service();
        let mut updates = service.fanout().subscribe();

        service
            .router()
            .dispatch("waste-wise/sensors/bin-7/data", br#"{"fill_level": 40}"#);

        let recorded = tasks.tasks();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].name, TaskName::ProcessSensorReading);

        let message = updates.try_recv().unwrap();
        assert_eq!(message.event, EventType::SensorUpdate);
        assert_eq!(message.data["sensor_id"], "bin-7");
    }

    #[tokio::test]
    async fn test_new_service_is_disconnected() {
        let (mut service, _) = service();
        assert_eq!(service.state(), ConnectionState::Disconnected);

        // Already disconnected, so this resolves immediately
        service.connection_lost().await;
        service.stop().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tracing_backend_is_default() {
        let queue = task_queue_from_config(&RelayConfig::default()).unwrap();
        assert_eq!(queue.backend(), "tracing");
    }
}
