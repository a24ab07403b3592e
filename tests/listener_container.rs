use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rs_sqs_listener::client::memory::{ClientCall, InMemoryQueueClient};
use rs_sqs_listener::client::{BufferConfig, QueueClient, ReceiveRequest};
use rs_sqs_listener::converter::{Payload, PayloadFormat};
use rs_sqs_listener::errors::SqsListenerError;
use rs_sqs_listener::handler::{HandlerContext, MessageHandler};
use rs_sqs_listener::message::QueueMessage;
use rs_sqs_listener::receiver::{
    BackoffConfig, ContainerState, DEAD_LETTER_REASON_ATTRIBUTE, DEAD_LETTER_SOURCE_ATTRIBUTE,
    DeadLetterConfig, DeletionPolicy, DispatchMode, ListenerConfig, PoisonMessagePolicy,
    SqsListenerContainer,
};
use rs_sqs_listener::SqsListenerBuilder;
use serde::Deserialize;
use tokio::time::{Instant, sleep, timeout};

/// Records every message it sees and fails the first `failures` of them.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<QueueMessage>>,
    failures: AtomicUsize,
}

impl RecordingHandler {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        })
    }

    fn seen(&self) -> Vec<QueueMessage> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        _payload: Payload,
        context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        self.seen.lock().unwrap().push(context.message().clone());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SqsListenerError::handler("simulated failure"));
        }
        Ok(())
    }
}

fn quick_config() -> ListenerConfig {
    ListenerConfig {
        wait_time_seconds: 0,
        poll_interval_millis: 10,
        ..Default::default()
    }
}

async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn setup(queue: &str) -> (Arc<InMemoryQueueClient>, String) {
    let client = Arc::new(InMemoryQueueClient::new());
    let url = client.create_queue(queue);
    (client, url)
}

#[tokio::test]
async fn successful_handling_deletes_with_the_received_handle() {
    let (client, url) = setup("orders");
    client.send(&url, "hello").unwrap();
    let handler = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", handler.clone(), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;

    let seen = handler.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body(), Some("hello"));
    assert_eq!(
        client.deleted_receipt_handles(&url),
        vec![seen[0].receipt_handle().clone()]
    );
    assert_eq!(client.approximate_number_of_messages(&url), 0);
    let deletes = client
        .calls()
        .into_iter()
        .filter(|call| *call == ClientCall::Delete)
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn failed_handling_leaves_message_in_flight() {
    let (client, url) = setup("orders");
    client.send(&url, "hello").unwrap();
    let handler = RecordingHandler::failing(1);

    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", handler.clone(), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| handler.count() == 1).await);
    container.stop().await;

    assert!(client.deleted_receipt_handles(&url).is_empty());
    assert_eq!(client.in_flight_count(&url), 1);
    assert!(!client.calls().iter().any(|call| matches!(
        call,
        ClientCall::Delete | ClientCall::DeleteBatch { .. } | ClientCall::ChangeVisibility
    )));
}

#[tokio::test]
async fn failed_message_is_redelivered_after_visibility_timeout() {
    let (client, url) = setup("orders");
    client.set_visibility_timeout(&url, 1);
    client.send(&url, "retry me").unwrap();
    let handler = RecordingHandler::failing(1);

    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", handler.clone(), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;

    let seen = handler.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].message_id(), seen[1].message_id());
    assert_ne!(seen[0].receipt_handle(), seen[1].receipt_handle());
    assert_eq!(seen[1].receive_count(), Some(2));
}

#[tokio::test]
async fn failure_visibility_timeout_makes_message_receivable_again() {
    let (client, url) = setup("orders");
    client.send(&url, "nack").unwrap();
    let handler = RecordingHandler::failing(1);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        failure_visibility_timeout_seconds: Some(0),
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;

    assert_eq!(handler.count(), 2);
    assert!(client.calls().contains(&ClientCall::ChangeVisibility));
}

#[tokio::test]
async fn stop_returns_within_the_long_poll_bound() {
    let (client, _url) = setup("orders");
    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        wait_time_seconds: 1,
        ..Default::default()
    };
    container
        .register("orders", RecordingHandler::failing(0), Some(config))
        .unwrap();
    container.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    container.stop().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(container.state(), ContainerState::Stopped);
    assert_eq!(container.active_tasks(), 0);
}

#[tokio::test]
async fn no_handler_runs_after_stop() {
    let (client, url) = setup("orders");
    let handler = RecordingHandler::failing(0);
    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", handler.clone(), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();
    container.stop().await;

    client.send(&url, "late").unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.count(), 0);
    assert_eq!(client.visible_count(&url), 1);
}

#[tokio::test]
async fn duplicate_handlers_fail_start() {
    let (client, url) = setup("orders");
    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", RecordingHandler::failing(0), Some(quick_config()))
        .unwrap();
    container
        .register(url.as_str(), RecordingHandler::failing(0), Some(quick_config()))
        .unwrap();

    let err = container.start().await.unwrap_err();

    assert!(matches!(err, SqsListenerError::DuplicateHandler { .. }));
    assert!(err.is_configuration());
    assert_eq!(container.state(), ContainerState::Created);
    assert_eq!(container.active_tasks(), 0);
}

#[tokio::test]
async fn unknown_queue_fails_start() {
    let client = Arc::new(InMemoryQueueClient::new());
    let mut container = SqsListenerContainer::new(client);
    container
        .register("nowhere", RecordingHandler::failing(0), Some(quick_config()))
        .unwrap();

    assert!(matches!(
        container.start().await,
        Err(SqsListenerError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn register_after_start_is_rejected() {
    let (client, _url) = setup("orders");
    client.create_queue("invoices");
    let mut container = SqsListenerContainer::new(client);
    container
        .register("orders", RecordingHandler::failing(0), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();

    let result = container.register("invoices", RecordingHandler::failing(0), None);

    assert!(matches!(result, Err(SqsListenerError::InvalidState { .. })));
    container.stop().await;
}

#[derive(Debug, Deserialize)]
struct Order {
    id: u64,
}

#[tokio::test]
async fn typed_handler_receives_deserialized_payload() {
    let (client, url) = setup("orders");
    client.send(&url, r#"{"id": 7}"#).unwrap();
    let ids = Arc::new(Mutex::new(Vec::new()));

    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register_json_fn(
            "orders",
            |order: Order, ids: Arc<Mutex<Vec<u64>>>| async move {
                ids.lock().unwrap().push(order.id);
                Ok(())
            },
            ids.clone(),
            Some(quick_config()),
        )
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;
    assert_eq!(*ids.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn malformed_json_is_moved_to_dead_letter_queue() {
    let (client, url) = setup("orders");
    let dlq_url = client.create_queue("orders-dlq");
    client.send(&url, "{not json").unwrap();
    let handler = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        payload_format: PayloadFormat::Json,
        dead_letter: Some(DeadLetterConfig {
            queue: "orders-dlq".into(),
            max_receive_count: None,
        }),
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;

    assert_eq!(handler.count(), 0);
    assert_eq!(client.approximate_number_of_messages(&url), 0);
    let request = ReceiveRequest {
        max_number_of_messages: 10,
        wait_time_seconds: 0,
        visibility_timeout_seconds: None,
    };
    let dead = client.receive_messages(&dlq_url, &request).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body(), Some("{not json"));
    assert_eq!(
        dead[0].message_attribute(DEAD_LETTER_SOURCE_ATTRIBUTE),
        Some(url.as_str())
    );
    assert!(dead[0].message_attribute(DEAD_LETTER_REASON_ATTRIBUTE).is_some());
}

#[tokio::test]
async fn malformed_message_is_discarded_without_dead_letter_queue() {
    let (client, url) = setup("orders");
    client.send_without_body(&url).unwrap();

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        poison_message_policy: PoisonMessagePolicy::Discard,
        ..quick_config()
    };
    container
        .register("orders", RecordingHandler::failing(0), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.approximate_number_of_messages(&url) == 0).await);
    container.stop().await;
}

#[tokio::test]
async fn exhausted_receive_count_is_dead_lettered() {
    let (client, url) = setup("orders");
    let dlq_url = client.create_queue("orders-dlq");
    client.send(&url, "always fails").unwrap();
    let handler = RecordingHandler::failing(usize::MAX);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        failure_visibility_timeout_seconds: Some(0),
        dead_letter: Some(DeadLetterConfig {
            queue: "orders-dlq".into(),
            max_receive_count: Some(3),
        }),
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.approximate_number_of_messages(&dlq_url) == 1).await);
    container.stop().await;

    assert_eq!(handler.count(), 3);
    assert_eq!(client.approximate_number_of_messages(&url), 0);
    assert_eq!(client.bodies(&dlq_url), vec!["always fails".to_string()]);
}

#[tokio::test]
async fn transient_receive_errors_are_retried() {
    let (client, url) = setup("orders");
    client.send(&url, "eventually").unwrap();
    client.fail_next_receives(&url, 2);
    let handler = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        backoff: BackoffConfig {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        },
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 1).await);
    container.stop().await;

    assert_eq!(handler.count(), 1);
    let receives = client
        .calls()
        .into_iter()
        .filter(|call| *call == ClientCall::Receive)
        .count();
    assert!(receives >= 3);
}

struct ManualAck {
    handled: AtomicUsize,
}

#[async_trait]
impl MessageHandler for ManualAck {
    async fn handle(
        &self,
        payload: Payload,
        context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        if payload.to_text() == "ack" {
            context.acknowledge().await?;
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn manual_acknowledgement_with_never_policy() {
    let (client, url) = setup("orders");
    client.send(&url, "ack").unwrap();
    client.send(&url, "keep").unwrap();
    let handler = Arc::new(ManualAck {
        handled: AtomicUsize::new(0),
    });

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        deletion_policy: DeletionPolicy::Never,
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| handler.handled.load(Ordering::SeqCst) == 2).await);
    container.stop().await;

    assert_eq!(client.deleted_receipt_handles(&url).len(), 1);
    assert_eq!(client.bodies(&url), vec!["keep".to_string()]);
}

struct SlowHandler {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(
        &self,
        _payload: Payload,
        _context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn parallel_dispatch_respects_concurrency_bound() {
    let (client, url) = setup("orders");
    for i in 0..8 {
        client.send(&url, &format!("message {i}")).unwrap();
    }
    let handler = Arc::new(SlowHandler {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        dispatch_mode: DispatchMode::Parallel { max_concurrency: 4 },
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 8).await);
    container.stop().await;

    let peak = handler.peak.load(Ordering::SeqCst);
    assert!(peak > 1, "expected concurrent handling, peak was {peak}");
    assert!(peak <= 4, "concurrency bound exceeded, peak was {peak}");
}

#[tokio::test]
async fn each_queue_is_routed_to_its_own_handler() {
    let client = Arc::new(InMemoryQueueClient::new());
    let orders_url = client.create_queue("orders");
    let invoices_url = client.create_queue("invoices");
    client.send(&invoices_url, "X").unwrap();
    let orders = RecordingHandler::failing(0);
    let invoices = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", orders.clone(), Some(quick_config()))
        .unwrap();
    container
        .register("invoices", invoices.clone(), Some(quick_config()))
        .unwrap();
    container.start().await.unwrap();
    assert_eq!(container.active_tasks(), 2);

    assert!(eventually(|| client.deleted_receipt_handles(&invoices_url).len() == 1).await);
    container.stop().await;

    assert_eq!(orders.count(), 0);
    assert_eq!(invoices.count(), 1);
    assert!(client.deleted_receipt_handles(&orders_url).is_empty());
}

#[tokio::test]
async fn stopped_container_can_be_restarted() {
    let (client, url) = setup("orders");
    let handler = RecordingHandler::failing(0);
    let mut container = SqsListenerContainer::new(client.clone());
    container
        .register("orders", handler.clone(), Some(quick_config()))
        .unwrap();

    container.start().await.unwrap();
    container.stop().await;
    client.send(&url, "second run").unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| handler.count() == 1).await);
    container.stop().await;
    assert_eq!(container.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn listener_flushes_buffered_deletes_on_shutdown() {
    let client = Arc::new(InMemoryQueueClient::new());
    let url = client.create_queue("orders");
    for body in ["a", "b", "c"] {
        client.send(&url, body).unwrap();
    }
    let handled = Arc::new(AtomicUsize::new(0));

    let mut listener = SqsListenerBuilder::new()
        .client(client.clone())
        .buffering(BufferConfig {
            max_batch_size: 10,
            max_batch_open: Duration::from_millis(300),
        })
        .default_config(ListenerConfig {
            dispatch_mode: DispatchMode::Parallel { max_concurrency: 10 },
            ..quick_config()
        })
        .build()
        .await
        .unwrap();
    listener
        .container_mut()
        .register_fn(
            "orders",
            |_message: String, handled: Arc<AtomicUsize>| async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            handled.clone(),
            None,
        )
        .unwrap();

    let signal = {
        let handled = handled.clone();
        async move {
            while handled.load(Ordering::SeqCst) < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        }
    };
    timeout(Duration::from_secs(5), listener.run_until(signal))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(listener.container().state(), ContainerState::Stopped);
    assert_eq!(client.deleted_receipt_handles(&url).len(), 3);
    assert!(
        client
            .calls()
            .contains(&ClientCall::DeleteBatch { entries: 3 })
    );
    assert!(!client.calls().contains(&ClientCall::Delete));
}

#[tokio::test]
async fn message_attributes_reach_the_handler() {
    let (client, url) = setup("orders");
    let mut attributes = HashMap::new();
    attributes.insert("contentType".to_string(), "application/json".to_string());
    client
        .send_with_attributes(&url, r#"{"id": 1}"#, attributes)
        .unwrap();
    let handler = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        payload_format: PayloadFormat::Auto,
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| handler.count() == 1).await);
    container.stop().await;
    assert_eq!(
        handler.seen()[0].message_attribute("contentType"),
        Some("application/json")
    );
}

#[tokio::test]
async fn sequential_batch_acknowledgements_share_one_buffered_call() {
    let client = Arc::new(InMemoryQueueClient::new());
    let url = client.create_queue("orders");
    for i in 0..5 {
        client.send(&url, &format!("message {i}")).unwrap();
    }
    let handler = RecordingHandler::failing(0);

    let mut listener = SqsListenerBuilder::new()
        .client(client.clone())
        .buffering(BufferConfig::default())
        .default_config(quick_config())
        .build()
        .await
        .unwrap();
    listener
        .container_mut()
        .register("orders", handler.clone(), None)
        .unwrap();
    listener.start().await.unwrap();

    assert!(eventually(|| client.deleted_receipt_handles(&url).len() == 5).await);
    listener.shutdown().await;

    let bodies: Vec<_> = handler
        .seen()
        .iter()
        .map(|message| message.body().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        bodies,
        (0..5).map(|i| format!("message {i}")).collect::<Vec<_>>()
    );
    let deletes: Vec<_> = client
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ClientCall::Delete | ClientCall::DeleteBatch { .. }))
        .collect();
    assert_eq!(deletes, vec![ClientCall::DeleteBatch { entries: 5 }]);
}

#[tokio::test]
async fn malformed_json_is_redelivered_by_default() {
    let (client, url) = setup("orders");
    client.set_visibility_timeout(&url, 1);
    client.send(&url, "{bad").unwrap();
    let handler = RecordingHandler::failing(0);

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        payload_format: PayloadFormat::Json,
        ..quick_config()
    };
    container
        .register("orders", handler.clone(), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.in_flight_count(&url) == 1).await);
    sleep(Duration::from_millis(1500)).await;
    container.stop().await;

    assert_eq!(handler.count(), 0);
    assert!(client.deleted_receipt_handles(&url).is_empty());
    assert!(!client.calls().iter().any(|call| matches!(
        call,
        ClientCall::Delete | ClientCall::DeleteBatch { .. } | ClientCall::ChangeVisibility
    )));
    assert_eq!(client.approximate_number_of_messages(&url), 1);

    assert!(eventually(|| client.visible_count(&url) == 1).await);
    let request = ReceiveRequest {
        max_number_of_messages: 1,
        wait_time_seconds: 0,
        visibility_timeout_seconds: None,
    };
    let again = client.receive_messages(&url, &request).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].body(), Some("{bad"));
    assert!(again[0].receive_count().unwrap_or_default() >= 3);
}

#[tokio::test]
async fn dead_letter_copy_stays_within_attribute_limit() {
    let (client, url) = setup("orders");
    let dlq_url = client.create_queue("orders-dlq");
    let attributes: HashMap<String, String> = (0..10)
        .map(|i| (format!("attr-{i}"), i.to_string()))
        .collect();
    client
        .send_with_attributes(&url, "{not json", attributes)
        .unwrap();

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        payload_format: PayloadFormat::Json,
        dead_letter: Some(DeadLetterConfig {
            queue: "orders-dlq".into(),
            max_receive_count: None,
        }),
        ..quick_config()
    };
    container
        .register("orders", RecordingHandler::failing(0), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.approximate_number_of_messages(&dlq_url) == 1).await);
    container.stop().await;

    let request = ReceiveRequest {
        max_number_of_messages: 1,
        wait_time_seconds: 0,
        visibility_timeout_seconds: None,
    };
    let dead = client.receive_messages(&dlq_url, &request).await.unwrap();
    assert_eq!(dead[0].message_attributes().len(), 10);
    assert_eq!(
        dead[0].message_attribute(DEAD_LETTER_SOURCE_ATTRIBUTE),
        Some(url.as_str())
    );
    assert_eq!(client.approximate_number_of_messages(&url), 0);
}

#[tokio::test]
async fn bodyless_message_is_not_dead_lettered() {
    let (client, url) = setup("orders");
    let dlq_url = client.create_queue("orders-dlq");
    client.send_without_body(&url).unwrap();

    let mut container = SqsListenerContainer::new(client.clone());
    let config = ListenerConfig {
        poison_message_policy: PoisonMessagePolicy::Discard,
        dead_letter: Some(DeadLetterConfig {
            queue: "orders-dlq".into(),
            max_receive_count: None,
        }),
        ..quick_config()
    };
    container
        .register("orders", RecordingHandler::failing(0), Some(config))
        .unwrap();
    container.start().await.unwrap();

    assert!(eventually(|| client.approximate_number_of_messages(&url) == 0).await);
    container.stop().await;

    assert_eq!(client.approximate_number_of_messages(&dlq_url), 0);
    assert!(!client.calls().contains(&ClientCall::Send));
}
