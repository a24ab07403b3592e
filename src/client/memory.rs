//! In-memory queue client for tests and local development.
//!
//! Behaves like SQS where the listener can observe it:
//! - received messages stay hidden for the visibility timeout, then reappear
//! - every delivery gets a fresh receipt handle; stale handles are rejected
//! - receives long-poll up to `wait_time_seconds`
//! - `ApproximateReceiveCount` is reported as a system attribute
//!
//! Every call is journaled so tests can assert on exactly what the listener did.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    BatchEntry, BatchEntryResult, MAX_MESSAGE_ATTRIBUTES, QueueClient, ReceiveRequest,
    VisibilityBatchEntry,
};
use crate::errors::SqsListenerError;
use crate::message::{APPROXIMATE_RECEIVE_COUNT, QueueMessage, ReceiptHandle};

const URL_PREFIX: &str = "https://sqs.in-memory.local/000000000000/";
const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: i32 = 30;
const LONG_POLL_TICK: Duration = Duration::from_millis(20);

/// A call made against an [`InMemoryQueueClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    GetQueueUrl,
    Receive,
    Delete,
    DeleteBatch { entries: usize },
    ChangeVisibility,
    ChangeVisibilityBatch { entries: usize },
    Send,
}

struct StoredMessage {
    message_id: String,
    body: Option<String>,
    attributes: HashMap<String, String>,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    /// The handle is live while the message is still hidden by its last receive.
    fn holds(&self, handle: &ReceiptHandle, now: Instant) -> bool {
        self.receipt_handle.as_ref() == Some(handle) && !self.is_visible(now)
    }
}

struct InMemoryQueue {
    visibility_timeout_seconds: i32,
    messages: Vec<StoredMessage>,
    deleted: Vec<ReceiptHandle>,
    pending_receive_failures: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, InMemoryQueue>,
    calls: Vec<ClientCall>,
}

/// Thread-safe in-process queue service implementing [`QueueClient`].
#[derive(Clone, Default)]
pub struct InMemoryQueueClient {
    state: Arc<Mutex<State>>,
    arrivals: Arc<Notify>,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue (idempotent) and returns its URL.
    pub fn create_queue(&self, name: &str) -> String {
        let url = format!("{URL_PREFIX}{name}");
        self.lock()
            .queues
            .entry(url.clone())
            .or_insert_with(|| InMemoryQueue {
                visibility_timeout_seconds: DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
                messages: Vec::new(),
                deleted: Vec::new(),
                pending_receive_failures: 0,
            });
        url
    }

    /// Sets the default visibility timeout applied to future receives.
    pub fn set_visibility_timeout(&self, queue_url: &str, seconds: i32) {
        if let Some(queue) = self.lock().queues.get_mut(queue_url) {
            queue.visibility_timeout_seconds = seconds;
        }
    }

    /// Enqueues a message with a text body, returning its id.
    pub fn send(&self, queue_url: &str, body: &str) -> Result<String, SqsListenerError> {
        self.enqueue(queue_url, Some(body.to_string()), HashMap::new())
    }

    /// Enqueues a message carrying string message attributes.
    pub fn send_with_attributes(
        &self,
        queue_url: &str,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, SqsListenerError> {
        self.enqueue(queue_url, Some(body.to_string()), attributes)
    }

    /// Enqueues a message with no body at all.
    pub fn send_without_body(&self, queue_url: &str) -> Result<String, SqsListenerError> {
        self.enqueue(queue_url, None, HashMap::new())
    }

    /// Makes the next `count` receives on the queue fail with a transient error.
    pub fn fail_next_receives(&self, queue_url: &str, count: usize) {
        if let Some(queue) = self.lock().queues.get_mut(queue_url) {
            queue.pending_receive_failures = count;
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ClientCall> {
        self.lock().calls.clone()
    }

    /// Handles successfully used to delete messages from the queue, in order.
    pub fn deleted_receipt_handles(&self, queue_url: &str) -> Vec<ReceiptHandle> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.deleted.clone())
            .unwrap_or_default()
    }

    /// Messages currently receivable.
    pub fn visible_count(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.messages.iter().filter(|m| m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Messages received but neither deleted nor visible again yet.
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.messages.iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Messages not yet deleted, visible or not.
    pub fn approximate_number_of_messages(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    /// Bodies of all messages still stored in the queue.
    pub fn bodies(&self, queue_url: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .filter_map(|m| m.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-call.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ClientCall) {
        self.lock().calls.push(call);
    }

    fn enqueue(
        &self,
        queue_url: &str,
        body: Option<String>,
        attributes: HashMap<String, String>,
    ) -> Result<String, SqsListenerError> {
        let message_id = Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            let queue = state
                .queues
                .get_mut(queue_url)
                .ok_or_else(|| SqsListenerError::QueueNotFound(queue_url.to_string()))?;
            queue.messages.push(StoredMessage {
                message_id: message_id.clone(),
                body,
                attributes,
                receive_count: 0,
                visible_at: Instant::now(),
                receipt_handle: None,
            });
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    fn try_receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, SqsListenerError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| SqsListenerError::QueueNotFound(queue_url.to_string()))?;

        if queue.pending_receive_failures > 0 {
            queue.pending_receive_failures -= 1;
            return Err(SqsListenerError::Transient {
                operation: "ReceiveMessage",
                message: "injected failure".to_string(),
            });
        }

        let now = Instant::now();
        let visibility = request
            .visibility_timeout_seconds
            .unwrap_or(queue.visibility_timeout_seconds)
            .max(0);
        let limit = request.max_number_of_messages.clamp(1, 10) as usize;

        let mut received = Vec::new();
        for stored in queue.messages.iter_mut().filter(|m| m.is_visible(now)) {
            if received.len() == limit {
                break;
            }
            let handle = ReceiptHandle::new(Uuid::new_v4().to_string());
            stored.receive_count += 1;
            stored.visible_at = now + Duration::from_secs(visibility as u64);
            stored.receipt_handle = Some(handle.clone());

            let mut system_attributes = HashMap::new();
            system_attributes.insert(
                APPROXIMATE_RECEIVE_COUNT.to_string(),
                stored.receive_count.to_string(),
            );
            received.push(
                QueueMessage::new(queue_url, &stored.message_id, handle, stored.body.clone())
                    .with_system_attributes(system_attributes)
                    .with_message_attributes(stored.attributes.clone()),
            );
        }
        Ok(received)
    }

    fn delete_now(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), SqsListenerError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| SqsListenerError::QueueNotFound(queue_url.to_string()))?;

        let now = Instant::now();
        let position = queue
            .messages
            .iter()
            .position(|m| m.holds(receipt_handle, now))
            .ok_or_else(|| SqsListenerError::InvalidReceiptHandle(receipt_handle.to_string()))?;
        queue.messages.remove(position);
        queue.deleted.push(receipt_handle.clone());
        debug!(queue = %queue_url, receipt = %receipt_handle, "Deleted message");
        Ok(())
    }

    fn change_visibility_now(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), SqsListenerError> {
        {
            let mut state = self.lock();
            let queue = state
                .queues
                .get_mut(queue_url)
                .ok_or_else(|| SqsListenerError::QueueNotFound(queue_url.to_string()))?;

            let now = Instant::now();
            let message = queue
                .messages
                .iter_mut()
                .find(|m| m.holds(receipt_handle, now))
                .ok_or_else(|| {
                    SqsListenerError::InvalidReceiptHandle(receipt_handle.to_string())
                })?;
            message.visible_at = now + Duration::from_secs(visibility_timeout_seconds.max(0) as u64);
        }
        if visibility_timeout_seconds <= 0 {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, SqsListenerError> {
        self.record(ClientCall::GetQueueUrl);
        let url = format!("{URL_PREFIX}{queue_name}");
        if self.lock().queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(SqsListenerError::QueueNotFound(queue_name.to_string()))
        }
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, SqsListenerError> {
        self.record(ClientCall::Receive);
        let deadline =
            Instant::now() + Duration::from_secs(request.wait_time_seconds.max(0) as u64);

        loop {
            let arrival = self.arrivals.notified();
            let messages = self.try_receive(queue_url, request)?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            // Messages whose visibility expires never notify, so wake up periodically.
            let tick = (deadline - now).min(LONG_POLL_TICK);
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), SqsListenerError> {
        self.record(ClientCall::Delete);
        self.delete_now(queue_url, receipt_handle)
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), SqsListenerError> {
        self.record(ClientCall::ChangeVisibility);
        self.change_visibility_now(queue_url, receipt_handle, visibility_timeout_seconds)
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        message_attributes: &HashMap<String, String>,
    ) -> Result<String, SqsListenerError> {
        self.record(ClientCall::Send);
        if body.is_empty() {
            return Err(invalid_parameter("message body must not be empty"));
        }
        if message_attributes.len() > MAX_MESSAGE_ATTRIBUTES {
            return Err(invalid_parameter(&format!(
                "{} message attributes exceed the limit of {MAX_MESSAGE_ATTRIBUTES}",
                message_attributes.len()
            )));
        }
        self.enqueue(queue_url, Some(body.to_string()), message_attributes.clone())
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<Vec<BatchEntryResult>, SqsListenerError> {
        self.record(ClientCall::DeleteBatch {
            entries: entries.len(),
        });
        Ok(entries
            .into_iter()
            .map(|entry| BatchEntryResult {
                result: self.delete_now(queue_url, &entry.receipt_handle),
                id: entry.id,
            })
            .collect())
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<VisibilityBatchEntry>,
    ) -> Result<Vec<BatchEntryResult>, SqsListenerError> {
        self.record(ClientCall::ChangeVisibilityBatch {
            entries: entries.len(),
        });
        Ok(entries
            .into_iter()
            .map(|entry| BatchEntryResult {
                result: self.change_visibility_now(
                    queue_url,
                    &entry.receipt_handle,
                    entry.visibility_timeout_seconds,
                ),
                id: entry.id,
            })
            .collect())
    }
}

fn invalid_parameter(message: &str) -> SqsListenerError {
    SqsListenerError::ServiceError {
        operation: "SendMessage",
        code: "InvalidParameterValue".to_string(),
        message: message.to_string(),
    }
}
