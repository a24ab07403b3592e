//! Routing of received messages to their registered handler.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::converter::{self, PayloadFormat};
use crate::errors::SqsListenerError;
use crate::handler::{HandlerContext, MessageHandler};
use crate::queue::QueueRef;

/// Result of dispatching one message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The handler completed successfully.
    Success,
    /// The handler returned an error or panicked.
    HandlerFailed(SqsListenerError),
    /// The payload could not be converted for the handler.
    Malformed(SqsListenerError),
    /// No handler is bound to the message's queue.
    NoHandler,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success)
    }
}

#[derive(Clone)]
struct Registration {
    queue: QueueRef,
    handler: Arc<dyn MessageHandler>,
    payload_format: PayloadFormat,
}

/// Dispatches messages to exactly one handler per queue.
///
/// Handlers are registered by [`QueueRef`]; before dispatching, every
/// registration is bound to its resolved queue URL with [`bind`](Self::bind).
/// Ambiguous registrations are reported by [`validate`](Self::validate) and
/// [`bind`](Self::bind), never while dispatching.
#[derive(Clone, Default)]
pub struct QueueMessageDispatcher {
    registrations: Vec<Registration>,
    bindings: HashMap<String, usize>,
}

impl QueueMessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `queue`. Duplicates are accepted here and rejected by
    /// [`validate`](Self::validate).
    pub fn register(
        &mut self,
        queue: impl Into<QueueRef>,
        handler: Arc<dyn MessageHandler>,
        payload_format: PayloadFormat,
    ) {
        self.registrations.push(Registration {
            queue: queue.into(),
            handler,
            payload_format,
        });
    }

    /// Queues with a registered handler, in registration order.
    pub fn queues(&self) -> impl Iterator<Item = &QueueRef> {
        self.registrations.iter().map(|registration| &registration.queue)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Fails with [`SqsListenerError::DuplicateHandler`] when a queue has more
    /// than one handler.
    pub fn validate(&self) -> Result<(), SqsListenerError> {
        let mut seen = HashSet::new();
        for registration in &self.registrations {
            if !seen.insert(&registration.queue) {
                return Err(SqsListenerError::DuplicateHandler {
                    queue: registration.queue.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Binds the handler registered for `queue` to its resolved URL.
    ///
    /// Two registrations that resolve to the same URL, e.g. one by name and
    /// one by URL, are a [`SqsListenerError::DuplicateHandler`].
    pub fn bind(&mut self, queue: &QueueRef, queue_url: &str) -> Result<(), SqsListenerError> {
        let index = self
            .registrations
            .iter()
            .position(|registration| &registration.queue == queue)
            .ok_or_else(|| {
                SqsListenerError::ConfigurationError(format!(
                    "no handler registered for queue '{queue}'"
                ))
            })?;

        match self.bindings.get(queue_url) {
            Some(existing) if *existing != index => Err(SqsListenerError::DuplicateHandler {
                queue: queue_url.to_string(),
            }),
            _ => {
                self.bindings.insert(queue_url.to_string(), index);
                Ok(())
            }
        }
    }

    /// Converts the message in `context` and invokes its handler.
    ///
    /// Handler errors and panics are captured in the outcome; a handler that
    /// reports [`SqsListenerError::DeserializationError`] is treated as a
    /// malformed message.
    pub async fn dispatch(&self, context: &HandlerContext) -> DispatchOutcome {
        let message = context.message();
        let Some(registration) = self
            .bindings
            .get(message.queue_url())
            .map(|index| &self.registrations[*index])
        else {
            return DispatchOutcome::NoHandler;
        };

        let payload = match converter::convert(message, registration.payload_format) {
            Ok(payload) => payload,
            Err(e) => return DispatchOutcome::Malformed(e),
        };

        debug!(
            queue = %registration.queue,
            message_id = %message.message_id(),
            "Dispatching message"
        );
        let invocation = AssertUnwindSafe(registration.handler.handle(payload, context));
        match invocation.catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Success,
            Ok(Err(e @ SqsListenerError::DeserializationError(_))) => DispatchOutcome::Malformed(e),
            Ok(Err(e)) => DispatchOutcome::HandlerFailed(e),
            Err(panic) => DispatchOutcome::HandlerFailed(SqsListenerError::HandlerError(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::memory::InMemoryQueueClient;
    use crate::converter::Payload;
    use crate::message::{QueueMessage, ReceiptHandle};

    struct Recording {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(
            &self,
            _payload: Payload,
            _context: &HandlerContext,
        ) -> Result<(), SqsListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SqsListenerError::handler("nope"))
            } else {
                Ok(())
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(
            &self,
            _payload: Payload,
            _context: &HandlerContext,
        ) -> Result<(), SqsListenerError> {
            panic!("handler exploded");
        }
    }

    fn recording(fail: bool) -> Arc<Recording> {
        Arc::new(Recording {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn context(queue_url: &str, body: Option<&str>) -> HandlerContext {
        let message = QueueMessage::new(
            queue_url,
            "m-1",
            ReceiptHandle::new("rh-1"),
            body.map(String::from),
        );
        HandlerContext::new(message, Arc::new(InMemoryQueueClient::new()))
    }

    #[test]
    fn duplicate_registration_fails_validation() {
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", recording(false), PayloadFormat::Text);
        dispatcher.register("orders", recording(false), PayloadFormat::Text);

        let err = dispatcher.validate().unwrap_err();
        assert!(matches!(err, SqsListenerError::DuplicateHandler { ref queue } if queue == "orders"));
    }

    #[test]
    fn name_and_url_for_same_queue_conflict_on_bind() {
        let url = "https://sqs.local/000/orders";
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", recording(false), PayloadFormat::Text);
        dispatcher.register(url, recording(false), PayloadFormat::Text);
        assert!(dispatcher.validate().is_ok());

        dispatcher.bind(&"orders".into(), url).unwrap();
        let err = dispatcher.bind(&url.into(), url).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn routes_to_bound_handler() {
        let orders = recording(false);
        let invoices = recording(false);
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", orders.clone(), PayloadFormat::Text);
        dispatcher.register("invoices", invoices.clone(), PayloadFormat::Text);
        dispatcher.bind(&"orders".into(), "u/orders").unwrap();
        dispatcher.bind(&"invoices".into(), "u/invoices").unwrap();

        let outcome = dispatcher.dispatch(&context("u/invoices", Some("X"))).await;

        assert!(outcome.is_success());
        assert_eq!(orders.calls.load(Ordering::SeqCst), 0);
        assert_eq!(invoices.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_is_failure_outcome() {
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", recording(true), PayloadFormat::Text);
        dispatcher.bind(&"orders".into(), "u/orders").unwrap();

        let outcome = dispatcher.dispatch(&context("u/orders", Some("X"))).await;
        assert!(matches!(outcome, DispatchOutcome::HandlerFailed(_)));
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", Arc::new(Panicking), PayloadFormat::Text);
        dispatcher.bind(&"orders".into(), "u/orders").unwrap();

        let outcome = dispatcher.dispatch(&context("u/orders", Some("X"))).await;
        match outcome {
            DispatchOutcome::HandlerFailed(SqsListenerError::HandlerError(message)) => {
                assert!(message.contains("handler exploded"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_is_malformed_and_handler_not_called() {
        let handler = recording(false);
        let mut dispatcher = QueueMessageDispatcher::new();
        dispatcher.register("orders", handler.clone(), PayloadFormat::Json);
        dispatcher.bind(&"orders".into(), "u/orders").unwrap();

        let outcome = dispatcher.dispatch(&context("u/orders", Some("{broken"))).await;

        assert!(matches!(outcome, DispatchOutcome::Malformed(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unbound_queue_has_no_handler() {
        let dispatcher = QueueMessageDispatcher::new();
        let outcome = dispatcher.dispatch(&context("u/unknown", Some("X"))).await;
        assert!(matches!(outcome, DispatchOutcome::NoHandler));
    }
}
