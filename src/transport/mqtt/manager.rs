//! Broker connection lifecycle and the background receive loop
//!
//! [`ConnectionManager`] owns one broker session at a time. `connect` spawns a
//! receive loop that waits for the CONNACK, subscribes every pattern registered
//! on the router and then dispatches inbound messages in delivery order.
//! Losing the connection ends the session; reconnecting is left to the caller.
//!
//! rumqttc drops the network when the broker refuses a single SUBSCRIBE filter
//! or publish. The receive loop then lets rumqttc re-establish the session once,
//! logs the refused request by name and subscribes the remaining patterns again,
//! so one bad request never ends the session.

use super::connection::{build_mqtt_options, qos_from_level, ConnectionState, MqttError};
use super::events::{classify_connection_error, route_mqtt_event, EventRoute, SessionInterruption};
use crate::config::BrokerConfig;
use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::protocol::{TopicBuilder, TopicPattern};
use crate::routing::TopicRouter;
use crate::transport::{OutboundPublisher, PublishError, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Time the receive loop gets to flush DISCONNECT before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spare request slots beyond one per subscription
const REQUEST_CHANNEL_HEADROOM: usize = 10;

type ConnectOutcome = Result<(), MqttError>;

/// A publish handed to rumqttc, tracked until the broker answers it
#[derive(Debug, Clone, PartialEq)]
struct OutboundPublish {
    topic: String,
    qos: QoS,
}

/// Publishes submitted on the request channel whose PUBLISH packet has not
/// been written yet, in submission order
type OutboundQueue = Arc<std::sync::Mutex<VecDeque<OutboundPublish>>>;

/// Shared publish handle onto the current broker session
pub struct BrokerLink {
    client: Mutex<Option<AsyncClient>>,
    state: watch::Receiver<ConnectionState>,
    outbound: OutboundQueue,
}

#[async_trait]
impl Transport for BrokerLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected { state });
        }

        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(PublishError::NotConnected {
            state: ConnectionState::Disconnected,
        })?;

        // Queued before submitting so the receive loop always finds it
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.push_back(OutboundPublish {
                topic: topic.to_string(),
                qos,
            });
        }
        let submitted = client.publish(topic, qos, false, payload).await;
        if submitted.is_err() {
            if let Ok(mut outbound) = self.outbound.lock() {
                outbound.pop_back();
            }
        }
        submitted.map_err(|e| PublishError::Rejected(sanitize_error_message(&e.to_string())))
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Owns the broker connection and its receive loop
pub struct ConnectionManager {
    config: BrokerConfig,
    router: Arc<TopicRouter>,
    link: Arc<BrokerLink>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    receive_loop: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, router: Arc<TopicRouter>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            router,
            link: Arc::new(BrokerLink {
                client: Mutex::new(None),
                state: state_rx,
                outbound: OutboundQueue::default(),
            }),
            state_tx: Arc::new(state_tx),
            shutdown_tx: None,
            receive_loop: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions, e.g. to notice an unexpected disconnect
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Publish seam bound to this manager's sessions
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.link.clone()
    }

    pub fn publisher(&self, topics: TopicBuilder) -> OutboundPublisher {
        OutboundPublisher::new(self.transport(), topics)
    }

    /// Connect, subscribe every registered pattern and start dispatching.
    ///
    /// No-op when already connected. Fails with [`MqttError::ConnectionFailed`]
    /// when the broker is unreachable or refuses the session, and without
    /// touching the network when the QoS or keep-alive settings are invalid.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        if self.is_connected() {
            debug!("Connect requested while already connected");
            return Ok(());
        }

        // A previous session may have ended on its own
        self.teardown().await;

        let subscribe_qos = qos_from_level(self.config.subscribe_qos)?;
        let options = build_mqtt_options(&self.config)?;

        metrics().mqtt_connection_attempt();
        self.state_tx.send_replace(ConnectionState::Connecting);
        info!(
            host = %self.config.host,
            port = self.config.port,
            patterns = self.router.len(),
            "Connecting to MQTT broker"
        );

        let (client, eventloop) =
            AsyncClient::new(options, self.router.len() + REQUEST_CHANNEL_HEADROOM);
        {
            let mut slot = self.link.client.lock().await;
            if let Ok(mut outbound) = self.link.outbound.lock() {
                outbound.clear();
            }
            *slot = Some(client.clone());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connack_tx, connack_rx) = oneshot::channel();
        let receive_loop = ReceiveLoop::new(
            client,
            self.router.clone(),
            self.state_tx.clone(),
            subscribe_qos,
            self.link.outbound.clone(),
            connack_tx,
        );
        let span = crate::mqtt_span!(operation = "receive_loop", client_id = %self.config.client_id);
        self.receive_loop = Some(tokio::spawn(
            receive_loop.run(eventloop, shutdown_rx).instrument(span),
        ));
        self.shutdown_tx = Some(shutdown_tx);

        let outcome =
            Self::wait_for_connection_confirmation(connack_rx, self.config.connect_timeout).await;
        match &outcome {
            Ok(()) => info!("Connected to MQTT broker"),
            Err(e) => {
                error!(error = %e, "Failed to connect to MQTT broker");
                metrics().mqtt_connection_failed();
                self.teardown().await;
            }
        }
        outcome
    }

    /// Wait for the receive loop to report the CONNACK outcome
    async fn wait_for_connection_confirmation(
        connack_rx: oneshot::Receiver<ConnectOutcome>,
        timeout: Duration,
    ) -> ConnectOutcome {
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MqttError::ConnectionFailed(
                "Receive loop stopped before broker acknowledgement".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectTimeout(timeout)),
        }
    }

    /// Stop dispatching and close the session. Idempotent.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let Some(mut handle) = self.receive_loop.take() else {
            debug!("Disconnect requested while not connected");
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return Ok(());
        };

        info!("Disconnecting from MQTT broker");
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        let client = self.link.client.lock().await.take();
        if let Some(client) = client {
            if !handle.is_finished() {
                if let Err(e) = client.disconnect().await {
                    debug!(error = %e, "Receive loop already gone, skipping DISCONNECT");
                }
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("Receive loop stopped gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Receive loop ended with error"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Receive loop didn't stop in time, forcing abort");
                handle.abort();
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        metrics().mqtt_disconnected();
        info!("MQTT client disconnected");
        Ok(())
    }

    /// Drop any session state without a graceful DISCONNECT
    async fn teardown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.receive_loop.take() {
            handle.abort();
        }
        self.link.client.lock().await.take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.receive_loop.take() {
            handle.abort();
        }
    }
}

/// Requests written to the broker and still awaiting an answer
#[derive(Debug, Default)]
struct RequestLedger {
    /// Patterns handed to rumqttc whose SUBSCRIBE has not been written yet
    queued_subscriptions: VecDeque<String>,
    subscriptions: VecDeque<(u16, String)>,
    publishes: VecDeque<(u16, OutboundPublish)>,
    rejected_patterns: HashSet<String>,
}

impl RequestLedger {
    fn subscription_requested(&mut self, pattern: String) {
        self.queued_subscriptions.push_back(pattern);
    }

    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(pattern) = self.queued_subscriptions.pop_front() {
            self.subscriptions.push_back((pkid, pattern));
        }
    }

    fn subscription_answered(&mut self, pkid: u16) -> Option<String> {
        let index = self.subscriptions.iter().position(|(id, _)| *id == pkid)?;
        self.subscriptions.remove(index).map(|(_, pattern)| pattern)
    }

    fn publish_sent(&mut self, pkid: u16, publish: OutboundPublish) {
        self.publishes.push_back((pkid, publish));
    }

    fn publish_answered(&mut self, pkid: u16) -> Option<OutboundPublish> {
        let index = self.publishes.iter().position(|(id, _)| *id == pkid)?;
        self.publishes.remove(index).map(|(_, publish)| publish)
    }

    /// Brokers answer in request order, so a refusal that carries no packet id
    /// belongs to the oldest unanswered SUBSCRIBE
    fn reject_oldest_subscription(&mut self) -> Option<String> {
        let (_, pattern) = self.subscriptions.pop_front()?;
        self.rejected_patterns.insert(pattern.clone());
        Some(pattern)
    }

    fn reject_oldest_publish(&mut self) -> Option<OutboundPublish> {
        self.publishes.pop_front().map(|(_, publish)| publish)
    }

    /// Forget packets written on the dropped network. Returns the unanswered
    /// publishes, which rumqttc writes again on the new one.
    fn reset_session(&mut self) -> Vec<OutboundPublish> {
        self.subscriptions.clear();
        self.publishes.drain(..).map(|(_, publish)| publish).collect()
    }

    /// Patterns a fresh session still needs, skipping refused ones and those
    /// rumqttc is already about to send
    fn patterns_to_subscribe<'a>(
        &self,
        patterns: impl Iterator<Item = &'a TopicPattern>,
    ) -> Vec<String> {
        patterns
            .map(|pattern| pattern.as_str().to_string())
            .filter(|pattern| {
                !self.rejected_patterns.contains(pattern)
                    && !self.queued_subscriptions.contains(pattern)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

/// State owned by one session's background task
struct ReceiveLoop {
    client: AsyncClient,
    router: Arc<TopicRouter>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscribe_qos: QoS,
    outbound: OutboundQueue,
    ledger: RequestLedger,
    connack_tx: Option<oneshot::Sender<ConnectOutcome>>,
    draining: bool,
    /// Refusal that dropped the network; rumqttc is re-establishing the session
    resuming: Option<SessionInterruption>,
}

impl ReceiveLoop {
    fn new(
        client: AsyncClient,
        router: Arc<TopicRouter>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        subscribe_qos: QoS,
        outbound: OutboundQueue,
        connack_tx: oneshot::Sender<ConnectOutcome>,
    ) -> Self {
        Self {
            client,
            router,
            state_tx,
            subscribe_qos,
            outbound,
            ledger: RequestLedger::default(),
            connack_tx: Some(connack_tx),
            draining: false,
            resuming: None,
        }
    }

    async fn run(mut self, mut eventloop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let polled = tokio::select! {
                changed = shutdown_rx.changed(), if !self.draining => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.begin_drain();
                    }
                    continue;
                }
                polled = eventloop.poll() => polled,
            };

            let control = match polled {
                Ok(event) => self.on_event(&event),
                Err(e) => self.on_poll_error(&e),
            };
            if control == LoopControl::Stop {
                break;
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        debug!("MQTT receive loop stopped");
    }

    fn begin_drain(&mut self) {
        debug!("Shutdown signal received, draining receive loop");
        self.draining = true;
    }

    fn on_event(&mut self, event: &Event) -> LoopControl {
        match route_mqtt_event(event) {
            EventRoute::ConnectionAcknowledged {
                session_present,
                refused: None,
            } => return self.on_connected(session_present),
            EventRoute::ConnectionAcknowledged {
                refused: Some(code),
                ..
            } => {
                if let Some(tx) = self.connack_tx.take() {
                    let _ = tx.send(Err(MqttError::ConnectionFailed(format!(
                        "Broker refused connection: {code}"
                    ))));
                } else {
                    warn!(reason = %code, "Broker refused to re-establish the session");
                    metrics().mqtt_connection_lost();
                }
                return LoopControl::Stop;
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                if self.draining {
                    warn!(topic = %topic, "Dropping message received during shutdown");
                    metrics().record_dropped_during_shutdown();
                } else {
                    debug!(topic = %topic, retain, bytes = payload.len(), "Received MQTT message");
                    self.router.dispatch(&topic, &payload);
                }
            }
            EventRoute::SubscribeSent { pkid } => self.ledger.subscribe_sent(pkid),
            EventRoute::SubscriptionAcknowledged { pkid, failures } => {
                let pattern = self
                    .ledger
                    .subscription_answered(pkid)
                    .unwrap_or_else(|| format!("packet {pkid}"));
                if failures.is_empty() {
                    info!(pattern = %pattern, "Subscribed to topic pattern");
                } else {
                    error!(pattern = %pattern, reason = ?failures, "Broker rejected subscription");
                    metrics().mqtt_subscription_failed();
                }
            }
            EventRoute::PublishSent { pkid } => {
                if let Some(publish) = self.next_outbound() {
                    if publish.qos == QoS::AtMostOnce {
                        info!(topic = %publish.topic, qos = ?publish.qos, "Published message");
                        metrics().mqtt_message_published();
                    } else {
                        self.ledger.publish_sent(pkid, publish);
                    }
                }
            }
            EventRoute::PublishAcknowledged { pkid, failure } => {
                let topic = self
                    .ledger
                    .publish_answered(pkid)
                    .map(|publish| publish.topic)
                    .unwrap_or_else(|| format!("packet {pkid}"));
                match failure {
                    None => {
                        info!(topic = %topic, pkid, "Published message");
                        metrics().mqtt_message_published();
                    }
                    Some(reason) => {
                        error!(topic = %topic, pkid, reason = %reason, "Broker rejected publish");
                        metrics().mqtt_publish_failed();
                    }
                }
            }
            EventRoute::Disconnected { reason, normal } => {
                if !self.draining {
                    report_broker_disconnect(&reason, normal);
                }
                return LoopControl::Stop;
            }
            EventRoute::OutgoingDisconnect => {
                if self.draining {
                    return LoopControl::Stop;
                }
            }
            EventRoute::Infrastructure(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::Outgoing => {}
        }
        LoopControl::Continue
    }

    fn on_connected(&mut self, session_present: bool) -> LoopControl {
        match self.resuming.take() {
            Some(refusal) => {
                self.report_refusal(refusal);
                let unanswered = self.ledger.reset_session();
                self.requeue(unanswered);
                info!(session_present, "Broker session re-established");
            }
            None => debug!(session_present, "Broker acknowledged connection"),
        }

        self.subscribe_all();
        self.state_tx.send_replace(ConnectionState::Connected);
        if let Some(tx) = self.connack_tx.take() {
            metrics().mqtt_connection_established();
            let _ = tx.send(Ok(()));
        }
        LoopControl::Continue
    }

    fn on_poll_error(&mut self, error: &ConnectionError) -> LoopControl {
        let detail = sanitize_error_message(&error.to_string());
        if let Some(tx) = self.connack_tx.take() {
            let _ = tx.send(Err(MqttError::ConnectionFailed(detail)));
            return LoopControl::Stop;
        }
        if self.draining {
            debug!(error = %detail, "Event loop closed during shutdown");
            return LoopControl::Stop;
        }

        let interruption = classify_connection_error(error);
        if interruption.is_request_rejection() && self.resuming.is_none() {
            debug!(error = %detail, "Broker refused a request, re-establishing the session");
            self.resuming = Some(interruption);
            return LoopControl::Continue;
        }
        if let Some(refusal) = self.resuming.take() {
            self.report_refusal(refusal);
        }

        match interruption {
            SessionInterruption::BrokerDisconnect { reason, normal } => {
                report_broker_disconnect(&reason, normal);
            }
            _ => {
                warn!(error = %detail, "Connection to MQTT broker lost");
                metrics().mqtt_connection_lost();
            }
        }
        LoopControl::Stop
    }

    /// Name the request a poll error refused
    fn report_refusal(&mut self, refusal: SessionInterruption) {
        match refusal {
            SessionInterruption::SubscriptionRejected { reason } => {
                let pattern = self
                    .ledger
                    .reject_oldest_subscription()
                    .unwrap_or_else(|| "unknown".to_string());
                error!(pattern = %pattern, reason = %reason, "Broker rejected subscription");
                metrics().mqtt_subscription_failed();
            }
            SessionInterruption::PublishRejected { reason } => {
                let topic = self
                    .ledger
                    .reject_oldest_publish()
                    .map(|publish| publish.topic)
                    .unwrap_or_else(|| "unknown".to_string());
                error!(topic = %topic, reason = %reason, "Broker rejected publish");
                metrics().mqtt_publish_failed();
            }
            SessionInterruption::BrokerDisconnect { .. } | SessionInterruption::ConnectionLost => {}
        }
    }

    fn next_outbound(&self) -> Option<OutboundPublish> {
        self.outbound
            .lock()
            .ok()
            .and_then(|mut outbound| outbound.pop_front())
    }

    /// Put publishes rumqttc writes again ahead of those still queued
    fn requeue(&self, publishes: Vec<OutboundPublish>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            for publish in publishes.into_iter().rev() {
                outbound.push_front(publish);
            }
        }
    }

    /// Subscribe every registered pattern the session still needs. A failure
    /// for one pattern is logged and does not stop the others.
    fn subscribe_all(&mut self) {
        for pattern in self.ledger.patterns_to_subscribe(self.router.patterns()) {
            let mut filter = Filter::new(pattern.as_str(), self.subscribe_qos);
            // Commands this service publishes must not come back as responses
            filter.nolocal = true;

            match self.client.try_subscribe_many(vec![filter]) {
                Ok(()) => self.ledger.subscription_requested(pattern),
                Err(e) => {
                    error!(pattern = %pattern, error = %e, "Failed to subscribe to topic pattern");
                    metrics().mqtt_subscription_failed();
                }
            }
        }
    }
}

fn report_broker_disconnect(reason: &str, normal: bool) {
    if normal {
        info!(reason = %reason, "Broker closed the connection");
        metrics().mqtt_disconnected();
    } else {
        warn!(reason = %reason, "Broker closed the connection unexpectedly");
        metrics().mqtt_connection_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, DisconnectReasonCode, Packet, PubAck, PubAckReason, Publish,
        SubAck, SubscribeReasonCode,
    };
    use rumqttc::v5::{MqttOptions, StateError};
    use rumqttc::Outgoing;

    const SENSORS: &str = "demo/sensors/+/data";
    const ALERTS: &str = "demo/alerts";
    const COMMANDS: &str = "demo/commands/+/response";

    struct Harness {
        receive_loop: ReceiveLoop,
        handler: Arc<RecordingHandler>,
        connack_rx: oneshot::Receiver<ConnectOutcome>,
        state_rx: watch::Receiver<ConnectionState>,
        // Keeps the request channel open for try_subscribe_many
        _eventloop: EventLoop,
    }

    fn harness() -> Harness {
        let handler = Arc::new(RecordingHandler::new("recording"));
        let mut router = TopicRouter::new();
        for pattern in [SENSORS, ALERTS, COMMANDS] {
            router.register(TopicPattern::parse(pattern).unwrap(), handler.clone());
        }
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("relay-test", "localhost", 1883), 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (connack_tx, connack_rx) = oneshot::channel();
        Harness {
            receive_loop: ReceiveLoop::new(
                client,
                Arc::new(router),
                Arc::new(state_tx),
                QoS::AtLeastOnce,
                OutboundQueue::default(),
                connack_tx,
            ),
            handler,
            connack_rx,
            state_rx,
            _eventloop: eventloop,
        }
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }))
    }

    fn suback(pkid: u16, code: SubscribeReasonCode) -> Event {
        Event::Incoming(Packet::SubAck(SubAck {
            pkid,
            return_codes: vec![code],
            properties: None,
        }))
    }

    fn inbound(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtMostOnce,
            payload.to_string(),
            None,
        )))
    }

    fn queue_publish(receive_loop: &ReceiveLoop, topic: &str, qos: QoS) {
        receive_loop
            .outbound
            .lock()
            .unwrap()
            .push_back(OutboundPublish {
                topic: topic.to_string(),
                qos,
            });
    }

    fn connect_and_send_subscriptions(harness: &mut Harness) {
        let receive_loop = &mut harness.receive_loop;
        assert_eq!(receive_loop.on_event(&connack()), LoopControl::Continue);
        for pkid in 1..=3 {
            receive_loop.on_event(&Event::Outgoing(Outgoing::Subscribe(pkid)));
        }
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_success() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).unwrap();
        assert!(
            ConnectionManager::wait_for_connection_confirmation(rx, Duration::from_millis(100))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_timeout() {
        let (_tx, rx) = oneshot::channel::<ConnectOutcome>();
        let result =
            ConnectionManager::wait_for_connection_confirmation(rx, Duration::from_millis(20))
                .await;
        assert!(matches!(result, Err(MqttError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_loop_gone() {
        let (tx, rx) = oneshot::channel::<ConnectOutcome>();
        drop(tx);
        let result =
            ConnectionManager::wait_for_connection_confirmation(rx, Duration::from_millis(100))
                .await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_link_refuses_publish_when_disconnected() {
        let manager = ConnectionManager::new(BrokerConfig::default(), Arc::new(TopicRouter::new()));
        let err = manager
            .transport()
            .publish("demo/out", b"{}".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_connack_subscribes_every_pattern() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);

        assert_eq!(*harness.state_rx.borrow(), ConnectionState::Connected);
        assert!(harness.connack_rx.try_recv().unwrap().is_ok());
        let ledger = &harness.receive_loop.ledger;
        assert!(ledger.queued_subscriptions.is_empty());
        assert_eq!(
            ledger.subscriptions,
            vec![
                (1, SENSORS.to_string()),
                (2, ALERTS.to_string()),
                (3, COMMANDS.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_subscription_does_not_end_session() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        receive_loop.on_event(&suback(1, SubscribeReasonCode::Success(QoS::AtLeastOnce)));

        let refused = ConnectionError::MqttState(StateError::SubFail {
            reason: SubscribeReasonCode::NotAuthorized,
        });
        assert_eq!(receive_loop.on_poll_error(&refused), LoopControl::Continue);
        assert_eq!(*harness.state_rx.borrow(), ConnectionState::Connected);

        assert_eq!(receive_loop.on_event(&connack()), LoopControl::Continue);
        let ledger = &receive_loop.ledger;
        assert!(ledger.rejected_patterns.contains(ALERTS));
        assert!(ledger.subscriptions.is_empty());
        // The new clean session needs every pattern except the refused one
        assert_eq!(
            ledger.queued_subscriptions,
            vec![SENSORS.to_string(), COMMANDS.to_string()]
        );
        assert_eq!(*harness.state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_second_failure_while_resuming_stops_loop() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;

        let refused = ConnectionError::MqttState(StateError::SubFail {
            reason: SubscribeReasonCode::NotAuthorized,
        });
        assert_eq!(receive_loop.on_poll_error(&refused), LoopControl::Continue);
        let unreachable = ConnectionError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        assert_eq!(receive_loop.on_poll_error(&unreachable), LoopControl::Stop);
        assert!(receive_loop.resuming.is_none());
        assert!(receive_loop.ledger.rejected_patterns.contains(SENSORS));
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_delivery_order() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        receive_loop.on_event(&inbound("demo/sensors/bin-1/data", r#"{"seq":1}"#));
        receive_loop.on_event(&inbound("demo/commands/bin-2/response", r#"{"seq":2}"#));
        receive_loop.on_event(&inbound("demo/sensors/bin-1/data", r#"{"seq":3}"#));

        let calls = harness.handler.calls();
        let order: Vec<_> = calls.iter().map(|(_, payload)| payload["seq"].clone()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(calls[1].0, "demo/commands/bin-2/response");
    }

    #[tokio::test]
    async fn test_messages_dropped_while_draining() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        receive_loop.on_event(&inbound("demo/sensors/bin-1/data", r#"{"seq":1}"#));
        receive_loop.begin_drain();
        assert_eq!(
            receive_loop.on_event(&inbound("demo/sensors/bin-1/data", r#"{"seq":2}"#)),
            LoopControl::Continue
        );
        assert_eq!(harness.handler.call_count(), 1);

        assert_eq!(
            receive_loop.on_event(&Event::Outgoing(Outgoing::Disconnect)),
            LoopControl::Stop
        );
    }

    #[tokio::test]
    async fn test_publish_ack_resolves_topic() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        queue_publish(receive_loop, "demo/commands/bin-1", QoS::AtLeastOnce);
        queue_publish(receive_loop, "demo/telemetry", QoS::AtMostOnce);

        receive_loop.on_event(&Event::Outgoing(Outgoing::Publish(7)));
        receive_loop.on_event(&Event::Outgoing(Outgoing::Publish(0)));
        assert_eq!(receive_loop.ledger.publishes.len(), 1);
        assert!(receive_loop.outbound.lock().unwrap().is_empty());

        receive_loop.on_event(&Event::Incoming(Packet::PubAck(PubAck {
            pkid: 7,
            reason: PubAckReason::Success,
            properties: None,
        })));
        assert!(receive_loop.ledger.publishes.is_empty());
    }

    #[tokio::test]
    async fn test_refused_publish_is_named_and_others_requeued() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        queue_publish(receive_loop, "demo/commands/bin-1", QoS::AtLeastOnce);
        queue_publish(receive_loop, "demo/commands/bin-2", QoS::AtLeastOnce);
        queue_publish(receive_loop, "demo/commands/bin-3", QoS::AtLeastOnce);
        receive_loop.on_event(&Event::Outgoing(Outgoing::Publish(4)));
        receive_loop.on_event(&Event::Outgoing(Outgoing::Publish(5)));

        let refused = ConnectionError::MqttState(StateError::PubAckFail {
            reason: PubAckReason::NotAuthorized,
        });
        assert_eq!(receive_loop.on_poll_error(&refused), LoopControl::Continue);
        receive_loop.on_event(&connack());

        assert!(receive_loop.ledger.publishes.is_empty());
        let requeued: Vec<_> = receive_loop
            .outbound
            .lock()
            .unwrap()
            .iter()
            .map(|publish| publish.topic.clone())
            .collect();
        assert_eq!(requeued, vec!["demo/commands/bin-2", "demo/commands/bin-3"]);
    }

    #[tokio::test]
    async fn test_broker_disconnect_stops_loop() {
        let mut harness = harness();
        connect_and_send_subscriptions(&mut harness);
        let receive_loop = &mut harness.receive_loop;
        let closed = ConnectionError::MqttState(StateError::ServerDisconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            reason_string: None,
        });
        assert_eq!(receive_loop.on_poll_error(&closed), LoopControl::Stop);
    }

    #[tokio::test]
    async fn test_poll_error_before_connack_fails_connect() {
        let mut harness = harness();
        let unreachable = ConnectionError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        assert_eq!(
            harness.receive_loop.on_poll_error(&unreachable),
            LoopControl::Stop
        );
        assert!(matches!(
            harness.connack_rx.try_recv().unwrap(),
            Err(MqttError::ConnectionFailed(_))
        ));
    }
}
