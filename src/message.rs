//! Received message representation.

use std::collections::HashMap;
use std::fmt;

use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};

/// System attribute carrying the number of times a message has been received.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// Message attribute inspected by [`PayloadFormat::Auto`](crate::converter::PayloadFormat).
pub const CONTENT_TYPE_ATTRIBUTE: &str = "contentType";

/// Opaque token identifying one delivery of a message.
///
/// Required to delete a message or change its visibility. A handle stops being
/// valid once the message is deleted or its visibility timeout expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        ReceiptHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from a queue.
///
/// Immutable once received: the listener hands out shared references and the
/// fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    message_id: String,
    body: Option<String>,
    system_attributes: HashMap<String, String>,
    message_attributes: HashMap<String, String>,
    receipt_handle: ReceiptHandle,
    queue_url: String,
}

impl QueueMessage {
    /// Creates a message as delivered from `queue_url`.
    pub fn new(
        queue_url: impl Into<String>,
        message_id: impl Into<String>,
        receipt_handle: ReceiptHandle,
        body: Option<String>,
    ) -> Self {
        QueueMessage {
            message_id: message_id.into(),
            body,
            system_attributes: HashMap::new(),
            message_attributes: HashMap::new(),
            receipt_handle,
            queue_url: queue_url.into(),
        }
    }

    pub fn with_system_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.system_attributes = attributes;
        self
    }

    pub fn with_message_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.message_attributes = attributes;
        self
    }

    /// Converts an SDK message received from `queue_url`.
    ///
    /// Only string-typed message attributes are kept; binary attributes are
    /// dropped.
    pub fn from_sqs(queue_url: &str, message: &Message) -> Self {
        let system_attributes = message
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (system_attribute_name(name), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let message_attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .string_value()
                            .map(|v| (name.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        QueueMessage {
            message_id: message.message_id().unwrap_or_default().to_string(),
            body: message.body().map(str::to_string),
            system_attributes,
            message_attributes,
            receipt_handle: ReceiptHandle::new(message.receipt_handle().unwrap_or_default()),
            queue_url: queue_url.to_string(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The message body, `None` when the service delivered no body.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn receipt_handle(&self) -> &ReceiptHandle {
        &self.receipt_handle
    }

    /// URL of the queue the message was received from.
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn system_attributes(&self) -> &HashMap<String, String> {
        &self.system_attributes
    }

    pub fn message_attributes(&self) -> &HashMap<String, String> {
        &self.message_attributes
    }

    pub fn message_attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    /// How many times this message has been received, when the service reports it.
    pub fn receive_count(&self) -> Option<u32> {
        self.system_attributes
            .get(APPROXIMATE_RECEIVE_COUNT)
            .and_then(|count| count.parse().ok())
    }
}

fn system_attribute_name(name: &MessageSystemAttributeName) -> String {
    name.as_str().to_string()
}
