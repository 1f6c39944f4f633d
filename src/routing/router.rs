//! Topic router: first-match dispatch of inbound messages to handlers
//!
//! Patterns are registered once at startup and evaluated in registration order.
//! Dispatch never fails outward: decode failures, unroutable topics and handler
//! faults (returned errors and panics alike) are logged and reported as a
//! [`DispatchOutcome`], so the receive loop survives any input.

use crate::observability::metrics::metrics;
use crate::protocol::{
    decode_object, DecodeError, InboundMessage, JsonObject, TopicError, TopicPattern,
};
use crate::tasks::TaskQueueError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors raised inside a handler body
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] DecodeError),
    #[error("No device identifier at segment {segment} of topic '{topic}'")]
    MissingDeviceId { topic: String, segment: usize },
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Task hand-off failed: {0}")]
    TaskQueue(#[from] TaskQueueError),
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// A stateless message handler bound to a topic pattern
pub trait MessageHandler: Send + Sync {
    /// Stable name used in logs and metrics
    fn name(&self) -> &str;

    /// Handle one decoded message. Must be fast and must not block.
    fn handle(&self, topic: &str, payload: &JsonObject) -> Result<(), HandlerError>;
}

/// Result of dispatching one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Bound handler ran to completion
    Handled { handler: String },
    /// Bound handler returned an error or panicked
    HandlerFault { handler: String, reason: String },
    /// No registered pattern matched the topic
    Unroutable,
    /// Payload was not a JSON object; no handler invoked
    DecodeFailed(DecodeError),
}

struct Route {
    pattern: TopicPattern,
    handler: Arc<dyn MessageHandler>,
}

/// Ordered pattern → handler table
#[derive(Default)]
pub struct TopicRouter {
    routes: Vec<Route>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a pattern to a handler. Later registrations never shadow earlier ones.
    pub fn register(&mut self, pattern: TopicPattern, handler: Arc<dyn MessageHandler>) {
        debug!(
            pattern = %pattern,
            handler = handler.name(),
            "Registered topic route"
        );
        self.routes.push(Route { pattern, handler });
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_route(mut self, pattern: TopicPattern, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(pattern, handler);
        self
    }

    /// Registered patterns in registration order
    pub fn patterns(&self) -> impl Iterator<Item = &TopicPattern> {
        self.routes.iter().map(|route| &route.pattern)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Name of the handler the topic would be routed to
    pub fn resolve(&self, topic: &str) -> Option<&str> {
        self.find(topic).map(|route| route.handler.name())
    }

    fn find(&self, topic: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.pattern.matches(topic))
    }

    pub fn dispatch_message(&self, message: &InboundMessage) -> DispatchOutcome {
        self.dispatch(&message.topic, &message.payload)
    }

    /// Decode the payload and invoke the first matching handler
    pub fn dispatch(&self, topic: &str, raw_payload: &[u8]) -> DispatchOutcome {
        let _span = crate::dispatch_span!(topic = %topic).entered();
        metrics().record_message_received();

        let payload = match decode_object(raw_payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to decode message payload");
                metrics().record_decode_failure();
                return DispatchOutcome::DecodeFailed(e);
            }
        };

        let Some(route) = self.find(topic) else {
            warn!(topic = %topic, "No handler registered for topic");
            metrics().record_unroutable();
            return DispatchOutcome::Unroutable;
        };

        let handler = route.handler.name().to_string();
        debug!(topic = %topic, handler = %handler, "Dispatching message");

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| route.handler.handle(topic, &payload)));
        let elapsed = started.elapsed();

        let fault = match result {
            Ok(Ok(())) => {
                metrics().record_routed(&handler, elapsed);
                return DispatchOutcome::Handled { handler };
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic_payload) => format!("handler panicked: {}", panic_message(&*panic_payload)),
        };

        error!(
            topic = %topic,
            handler = %handler,
            payload = %serde_json::Value::Object(payload),
            reason = %fault,
            "Handler failed to process message"
        );
        metrics().record_handler_fault(&handler, elapsed);
        DispatchOutcome::HandlerFault {
            handler,
            reason: fault,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FaultyHandler, RecordingHandler};
    use serde_json::json;

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    #[test]
    fn test_dispatch_invokes_first_matching_handler() {
        let first = Arc::new(RecordingHandler::new("first"));
        let second = Arc::new(RecordingHandler::new("second"));
        let router = TopicRouter::new()
            .with_route(pattern("demo/sensors/+/data"), first.clone())
            .with_route(pattern("demo/#"), second.clone());

        let outcome = router.dispatch("demo/sensors/abc/data", br#"{"fill_level": 1}"#);

        assert_eq!(
            outcome,
            DispatchOutcome::Handled {
                handler: "first".to_string()
            }
        );
        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 0);
    }

    #[test]
    fn test_dispatch_falls_through_to_later_pattern() {
        let first = Arc::new(RecordingHandler::new("first"));
        let second = Arc::new(RecordingHandler::new("second"));
        let router = TopicRouter::new()
            .with_route(pattern("demo/sensors/+/data"), first.clone())
            .with_route(pattern("demo/#"), second.clone());

        router.dispatch("demo/alerts", br#"{"code": "X"}"#);

        assert_eq!(first.call_count(), 0);
        assert_eq!(second.call_count(), 1);
        assert_eq!(second.calls()[0].0, "demo/alerts");
    }

    #[test]
    fn test_unroutable_topic() {
        let handler = Arc::new(RecordingHandler::new("only"));
        let router = TopicRouter::new().with_route(pattern("demo/alerts"), handler.clone());

        let outcome = router.dispatch("other/alerts", b"{}");

        assert_eq!(outcome, DispatchOutcome::Unroutable);
        assert_eq!(handler.call_count(), 0);
    }

    #[test]
    fn test_decode_failure_skips_handlers() {
        let handler = Arc::new(RecordingHandler::new("only"));
        let router = TopicRouter::new().with_route(pattern("demo/#"), handler.clone());

        let outcome = router.dispatch("demo/alerts", b"{not json");

        assert!(matches!(outcome, DispatchOutcome::DecodeFailed(_)));
        assert_eq!(handler.call_count(), 0);
    }

    #[test]
    fn test_non_object_payload_is_decode_failure() {
        let handler = Arc::new(RecordingHandler::new("only"));
        let router = TopicRouter::new().with_route(pattern("demo/#"), handler.clone());

        let outcome = router.dispatch("demo/alerts", b"[1, 2, 3]");

        assert_eq!(
            outcome,
            DispatchOutcome::DecodeFailed(DecodeError::NotAnObject("array"))
        );
        assert_eq!(handler.call_count(), 0);
    }

    #[test]
    fn test_handler_error_is_contained() {
        let router = TopicRouter::new()
            .with_route(pattern("demo/alerts"), Arc::new(FaultyHandler::failing("bad")));

        let outcome = router.dispatch("demo/alerts", b"{}");

        assert!(matches!(
            outcome,
            DispatchOutcome::HandlerFault { ref handler, .. } if handler == "bad"
        ));
    }

    #[test]
    fn test_handler_panic_is_contained_and_router_stays_usable() {
        let healthy = Arc::new(RecordingHandler::new("healthy"));
        let router = TopicRouter::new()
            .with_route(pattern("demo/alerts"), Arc::new(FaultyHandler::panicking("boom")))
            .with_route(pattern("demo/#"), healthy.clone());

        let outcome = router.dispatch("demo/alerts", b"{}");
        match outcome {
            DispatchOutcome::HandlerFault { handler, reason } => {
                assert_eq!(handler, "boom");
                assert!(reason.contains("panicked"));
            }
            other => panic!("expected handler fault, got {other:?}"),
        }

        let outcome = router.dispatch("demo/other", br#"{"ok": true}"#);
        assert!(matches!(outcome, DispatchOutcome::Handled { .. }));
        assert_eq!(healthy.calls()[0].1, json!({"ok": true}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let router = TopicRouter::new()
            .with_route(pattern("demo/+/x"), Arc::new(RecordingHandler::new("a")))
            .with_route(pattern("demo/y/+"), Arc::new(RecordingHandler::new("b")));

        for _ in 0..10 {
            assert_eq!(router.resolve("demo/y/x"), Some("a"));
        }
        assert_eq!(router.resolve("demo/y/z"), Some("b"));
        assert_eq!(router.resolve("nothing"), None);
    }

    #[test]
    fn test_patterns_preserve_registration_order() {
        let router = TopicRouter::new()
            .with_route(pattern("b/#"), Arc::new(RecordingHandler::new("b")))
            .with_route(pattern("a/#"), Arc::new(RecordingHandler::new("a")));

        let patterns: Vec<&str> = router.patterns().map(|p| p.as_str()).collect();
        assert_eq!(patterns, vec!["b/#", "a/#"]);
        assert_eq!(router.len(), 2);
        assert!(!router.is_empty());
    }
}
