use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::client::QueueClient;
use crate::converter::Payload;
use crate::errors::SqsListenerError;
use crate::message::QueueMessage;

/// Trait for application message handlers.
///
/// A handler is registered for exactly one queue. Returning `Ok(())` lets the
/// container acknowledge (delete) the message according to its deletion policy;
/// returning an error leaves it for redelivery.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use rs_sqs_listener::converter::Payload;
/// use rs_sqs_listener::errors::SqsListenerError;
/// use rs_sqs_listener::handler::{HandlerContext, MessageHandler};
///
/// struct AuditHandler;
///
/// #[async_trait]
/// impl MessageHandler for AuditHandler {
///     async fn handle(
///         &self,
///         payload: Payload,
///         context: &HandlerContext,
///     ) -> Result<(), SqsListenerError> {
///         tracing::info!(id = context.message().message_id(), body = %payload.to_text(), "audit");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one converted message.
    ///
    /// # Arguments
    ///
    /// * `payload` - The message body after conversion
    /// * `context` - The received message plus manual acknowledgement and
    ///   visibility controls
    async fn handle(
        &self,
        payload: Payload,
        context: &HandlerContext,
    ) -> Result<(), SqsListenerError>;
}

/// Per-message context handed to a [`MessageHandler`].
pub struct HandlerContext {
    message: QueueMessage,
    client: Arc<dyn QueueClient>,
    acknowledged: AtomicBool,
}

impl HandlerContext {
    pub fn new(message: QueueMessage, client: Arc<dyn QueueClient>) -> Self {
        HandlerContext {
            message,
            client,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    /// Deletes the message from its queue.
    ///
    /// Only the first successful call deletes; later calls return `Ok(())`
    /// without touching the queue. The container uses the same guard, so a
    /// message acknowledged here is not deleted a second time.
    pub async fn acknowledge(&self) -> Result<(), SqsListenerError> {
        if self.acknowledged.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .client
            .delete_message(self.message.queue_url(), self.message.receipt_handle())
            .await;
        match result {
            Ok(()) => {
                debug!(
                    queue = %self.message.queue_url(),
                    message_id = %self.message.message_id(),
                    "Acknowledged message"
                );
                Ok(())
            }
            Err(e) => {
                self.acknowledged.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Hides the message for another `visibility_timeout_seconds`, counted from now.
    ///
    /// Use it to extend processing time, or pass `0` to make the message
    /// immediately receivable again.
    pub async fn change_visibility(
        &self,
        visibility_timeout_seconds: i32,
    ) -> Result<(), SqsListenerError> {
        self.client
            .change_message_visibility(
                self.message.queue_url(),
                self.message.receipt_handle(),
                visibility_timeout_seconds,
            )
            .await
    }
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(
        &self,
        payload: Payload,
        context: &HandlerContext,
    ) -> Result<(), SqsListenerError> {
        (**self).handle(payload, context).await
    }
}
