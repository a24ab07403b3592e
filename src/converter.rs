//! Payload conversion applied before a handler is invoked.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::errors::SqsListenerError;
use crate::message::{CONTENT_TYPE_ATTRIBUTE, QueueMessage};

/// How a message body is converted for its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Body passed through as a string.
    #[default]
    Text,
    /// Body parsed as JSON; parse failures make the message malformed.
    Json,
    /// JSON when the `contentType` message attribute says so, text otherwise.
    Auto,
}

impl std::str::FromStr for PayloadFormat {
    type Err = SqsListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(PayloadFormat::Text),
            "json" => Ok(PayloadFormat::Json),
            "auto" => Ok(PayloadFormat::Auto),
            other => Err(SqsListenerError::ConfigurationError(format!(
                "unknown payload format '{other}'"
            ))),
        }
    }
}

/// A converted message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// The payload rendered as text; JSON is re-serialized.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Json(value) => value.to_string(),
        }
    }

    /// Deserializes the payload into `T`, parsing text payloads as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, SqsListenerError> {
        let value = match self {
            Payload::Text(text) => serde_json::from_str(text)?,
            Payload::Json(value) => T::deserialize(value)?,
        };
        Ok(value)
    }
}

/// Converts `message` according to `format`.
///
/// A missing body is always a [`SqsListenerError::DeserializationError`].
pub fn convert(message: &QueueMessage, format: PayloadFormat) -> Result<Payload, SqsListenerError> {
    let body = message.body().ok_or_else(|| {
        SqsListenerError::DeserializationError(format!(
            "message {} has no body",
            message.message_id()
        ))
    })?;

    let as_json = match format {
        PayloadFormat::Text => false,
        PayloadFormat::Json => true,
        PayloadFormat::Auto => message
            .message_attribute(CONTENT_TYPE_ATTRIBUTE)
            .is_some_and(|content_type| content_type.starts_with("application/json")),
    };

    if as_json {
        Ok(Payload::Json(serde_json::from_str(body)?))
    } else {
        Ok(Payload::Text(body.to_string()))
    }
}
