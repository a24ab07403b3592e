use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::{DeletionPolicy, DispatchMode, ListenerConfig, PoisonMessagePolicy};
use crate::client::{MAX_MESSAGE_ATTRIBUTES, QueueClient, ReceiveRequest};
use crate::dispatcher::{DispatchOutcome, QueueMessageDispatcher};
use crate::errors::SqsListenerError;
use crate::handler::HandlerContext;
use crate::message::QueueMessage;

/// Attribute naming the queue a dead-lettered message came from.
pub const DEAD_LETTER_SOURCE_ATTRIBUTE: &str = "deadLetterSourceQueue";
/// Attribute carrying the reason a message was dead-lettered.
pub const DEAD_LETTER_REASON_ATTRIBUTE: &str = "deadLetterReason";

/// The polling task of one registered queue.
pub(crate) struct QueuePoller {
    pub(crate) queue_url: String,
    pub(crate) dead_letter_url: Option<String>,
    pub(crate) config: ListenerConfig,
    pub(crate) client: Arc<dyn QueueClient>,
    pub(crate) dispatcher: Arc<QueueMessageDispatcher>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl QueuePoller {
    /// Polls until shutdown is signalled. The receive in flight when the
    /// signal arrives is allowed to finish and its messages are processed.
    pub(crate) async fn run(mut self) {
        info!(queue = %self.queue_url, "Polling task started");
        let request = self.config.receive_request();
        let idle_pause = Duration::from_millis(self.config.poll_interval_millis);

        while !self.is_shutting_down() {
            let Some(messages) = self.receive_with_backoff(&request).await else {
                continue;
            };

            if messages.is_empty() {
                debug!(queue = %self.queue_url, "No messages received");
                if !idle_pause.is_zero() {
                    self.pause(idle_pause).await;
                }
                continue;
            }

            self.process_batch(messages).await;
        }
        info!(queue = %self.queue_url, "Polling task stopped");
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleeps for `delay` unless shutdown is signalled first.
    /// Returns `false` when interrupted by shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    /// Receives one batch, retrying transient failures with backoff.
    ///
    /// Returns `None` when retries are exhausted, the error is not retryable,
    /// or shutdown interrupted a backoff pause.
    async fn receive_with_backoff(&mut self, request: &ReceiveRequest) -> Option<Vec<QueueMessage>> {
        let backoff = self.config.backoff.clone();
        let mut attempt = 0;

        loop {
            match self.client.receive_messages(&self.queue_url, request).await {
                Ok(messages) => {
                    if attempt > 0 {
                        debug!(queue = %self.queue_url, retries = attempt, "Receive succeeded after retries");
                    }
                    return Some(messages);
                }
                Err(e) if e.is_transient() && attempt < backoff.max_retries => {
                    attempt += 1;
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        queue = %self.queue_url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Error receiving messages, retrying"
                    );
                    if !self.pause(delay).await {
                        return None;
                    }
                }
                Err(e) => {
                    error!(
                        queue = %self.queue_url,
                        attempts = attempt + 1,
                        error = %e,
                        "Error receiving messages, polling continues"
                    );
                    self.pause(backoff.max_delay()).await;
                    return None;
                }
            }
        }
    }

    /// Sequential mode invokes handlers in receive order, then settles the
    /// whole batch at once.
    async fn process_batch(&self, messages: Vec<QueueMessage>) {
        match self.config.dispatch_mode {
            DispatchMode::Sequential => {
                let mut settlements = Vec::with_capacity(messages.len());
                for message in messages {
                    let context = HandlerContext::new(message, self.client.clone());
                    let outcome = self.dispatcher.dispatch(&context).await;
                    settlements.push(self.settle(context, outcome));
                }
                join_all(settlements).await;
            }
            DispatchMode::Parallel { max_concurrency } => {
                futures::stream::iter(messages)
                    .for_each_concurrent(max_concurrency, |message| self.process(message))
                    .await;
            }
        }
    }

    async fn process(&self, message: QueueMessage) {
        let context = HandlerContext::new(message, self.client.clone());
        let outcome = self.dispatcher.dispatch(&context).await;
        self.settle(context, outcome).await;
    }

    /// Applies the deletion, nack and dead-letter policies to a dispatch outcome.
    async fn settle(&self, context: HandlerContext, outcome: DispatchOutcome) {
        let context = &context;
        let message = context.message();

        match outcome {
            DispatchOutcome::Success => {
                debug!(queue = %self.queue_url, message_id = %message.message_id(), "Message handled");
                if self.config.deletion_policy != DeletionPolicy::Never {
                    self.delete(context).await;
                }
            }
            DispatchOutcome::HandlerFailed(e) => {
                warn!(
                    queue = %self.queue_url,
                    message_id = %message.message_id(),
                    error = %e,
                    "Error handling message"
                );
                self.on_failure(context, &e).await;
            }
            DispatchOutcome::Malformed(e) => {
                warn!(
                    queue = %self.queue_url,
                    message_id = %message.message_id(),
                    error = %e,
                    "Malformed message"
                );
                self.on_malformed(context, &e).await;
            }
            DispatchOutcome::NoHandler => {
                error!(
                    queue = %self.queue_url,
                    message_id = %message.message_id(),
                    "No handler bound to queue, leaving message for redelivery"
                );
            }
        }
    }

    async fn delete(&self, context: &HandlerContext) {
        if let Err(e) = context.acknowledge().await {
            error!(
                queue = %self.queue_url,
                message_id = %context.message().message_id(),
                receipt = %context.message().receipt_handle(),
                error = %e,
                "Error deleting message"
            );
        }
    }

    async fn on_failure(&self, context: &HandlerContext, reason: &SqsListenerError) {
        if self.config.deletion_policy == DeletionPolicy::Always {
            self.delete(context).await;
            return;
        }

        let max_receive_count = self
            .config
            .dead_letter
            .as_ref()
            .and_then(|dead_letter| dead_letter.max_receive_count);
        if let (Some(dead_letter_url), Some(max)) = (&self.dead_letter_url, max_receive_count) {
            let exhausted = context
                .message()
                .receive_count()
                .is_some_and(|count| count >= max);
            if exhausted && self.dead_letter(context, dead_letter_url, reason).await {
                return;
            }
        }

        if let Some(timeout) = self.config.failure_visibility_timeout_seconds {
            if let Err(e) = context.change_visibility(timeout).await {
                warn!(
                    queue = %self.queue_url,
                    message_id = %context.message().message_id(),
                    error = %e,
                    "Error changing message visibility"
                );
            }
        }
    }

    async fn on_malformed(&self, context: &HandlerContext, reason: &SqsListenerError) {
        if let Some(dead_letter_url) = &self.dead_letter_url {
            if self.dead_letter(context, dead_letter_url, reason).await {
                return;
            }
        }

        match self.config.poison_message_policy {
            PoisonMessagePolicy::Discard => {
                warn!(
                    queue = %self.queue_url,
                    message_id = %context.message().message_id(),
                    "Discarding malformed message"
                );
                self.delete(context).await;
            }
            PoisonMessagePolicy::Redeliver => self.on_failure(context, reason).await,
        }
    }

    /// Copies the message to the dead-letter queue, then deletes the original.
    ///
    /// Returns `false` when nothing was handed over: the message has no body,
    /// which SQS cannot send, or the send failed. The original is left alone
    /// in both cases.
    async fn dead_letter(
        &self,
        context: &HandlerContext,
        dead_letter_url: &str,
        reason: &SqsListenerError,
    ) -> bool {
        let message = context.message();
        let Some(body) = message.body().filter(|body| !body.is_empty()) else {
            warn!(
                queue = %self.queue_url,
                message_id = %message.message_id(),
                "Message has no body and cannot be dead-lettered"
            );
            return false;
        };

        let attributes =
            dead_letter_attributes(message.message_attributes(), &self.queue_url, reason);
        match self.client.send_message(dead_letter_url, body, &attributes).await {
            Ok(dead_letter_id) => {
                warn!(
                    queue = %self.queue_url,
                    message_id = %message.message_id(),
                    dead_letter_queue = %dead_letter_url,
                    dead_letter_id = %dead_letter_id,
                    "Moved message to dead-letter queue"
                );
                self.delete(context).await;
                true
            }
            Err(e) => {
                error!(
                    queue = %self.queue_url,
                    message_id = %message.message_id(),
                    dead_letter_queue = %dead_letter_url,
                    error = %e,
                    "Error sending message to dead-letter queue"
                );
                false
            }
        }
    }
}

/// Attributes for a dead-lettered copy: source queue and reason first, then
/// the original attributes in name order up to [`MAX_MESSAGE_ATTRIBUTES`].
fn dead_letter_attributes(
    original: &HashMap<String, String>,
    source_queue_url: &str,
    reason: &SqsListenerError,
) -> HashMap<String, String> {
    let mut attributes = HashMap::with_capacity(MAX_MESSAGE_ATTRIBUTES);
    attributes.insert(
        DEAD_LETTER_SOURCE_ATTRIBUTE.to_string(),
        source_queue_url.to_string(),
    );
    attributes.insert(DEAD_LETTER_REASON_ATTRIBUTE.to_string(), reason.to_string());

    let mut names: Vec<&String> = original
        .keys()
        .filter(|name| !attributes.contains_key(name.as_str()))
        .collect();
    names.sort();
    let room = MAX_MESSAGE_ATTRIBUTES - attributes.len();
    if names.len() > room {
        debug!(
            queue = %source_queue_url,
            dropped = names.len() - room,
            "Dropping message attributes beyond the SQS limit"
        );
    }
    for name in names.into_iter().take(room) {
        attributes.insert(name.clone(), original[name].clone());
    }
    attributes
}
