use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::client::ReceiveRequest;
use crate::converter::PayloadFormat;
use crate::errors::SqsListenerError;
use crate::queue::QueueRef;

/// When the container deletes a message after dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete after the handler succeeds.
    #[default]
    OnSuccess,
    /// Delete after every dispatch, whatever the outcome.
    Always,
    /// Never delete; the handler acknowledges through its context.
    Never,
}

impl FromStr for DeletionPolicy {
    type Err = SqsListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "on_success" => Ok(DeletionPolicy::OnSuccess),
            "always" => Ok(DeletionPolicy::Always),
            "never" | "manual" => Ok(DeletionPolicy::Never),
            other => Err(SqsListenerError::ConfigurationError(format!(
                "unknown deletion policy '{other}'"
            ))),
        }
    }
}

/// How the messages of one receive batch are handed to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// One message at a time, in receive order.
    #[default]
    Sequential,
    /// Up to `max_concurrency` messages of the batch at once.
    Parallel { max_concurrency: usize },
}

/// What happens to a message that cannot be converted for its handler when no
/// dead-letter queue is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonMessagePolicy {
    /// Treat it like a handler failure and let it be redelivered.
    #[default]
    Redeliver,
    /// Log it and delete it.
    Discard,
}

/// Where failing messages are moved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeadLetterConfig {
    /// The dead-letter queue, by name or URL.
    pub queue: QueueRef,

    /// Handler failures are dead-lettered once a message has been received this
    /// many times. `None` dead-letters only malformed messages.
    #[serde(default)]
    pub max_receive_count: Option<u32>,
}

/// Exponential backoff for transient receive errors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (starting at 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Configuration for one listener registration.
///
/// Every field has a default, so a partial JSON/YAML document or
/// [`ListenerConfig::from_env`] can be used to build one.
///
/// # Fields
/// - `max_number_of_messages`: The maximum number of messages to receive in a single request.
/// - `wait_time_seconds`: The wait time for long polling, in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// The maximum number of messages to receive in a single request (1-10).
    pub max_number_of_messages: i32,

    /// The wait time for long polling, in seconds (0-20).
    pub wait_time_seconds: i32,

    /// Overrides the queue's visibility timeout for received messages.
    pub visibility_timeout_seconds: Option<i32>,

    /// Pause after a receive that returned nothing, in milliseconds.
    pub poll_interval_millis: u64,

    pub deletion_policy: DeletionPolicy,

    pub payload_format: PayloadFormat,

    pub dispatch_mode: DispatchMode,

    /// When set, a failed message is made visible again after this many
    /// seconds instead of waiting out its full visibility timeout.
    pub failure_visibility_timeout_seconds: Option<i32>,

    pub poison_message_policy: PoisonMessagePolicy,

    pub dead_letter: Option<DeadLetterConfig>,

    pub backoff: BackoffConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            max_number_of_messages: 10,
            wait_time_seconds: 20,
            visibility_timeout_seconds: None,
            poll_interval_millis: 0,
            deletion_policy: DeletionPolicy::default(),
            payload_format: PayloadFormat::default(),
            dispatch_mode: DispatchMode::default(),
            failure_visibility_timeout_seconds: None,
            poison_message_policy: PoisonMessagePolicy::default(),
            dead_letter: None,
            backoff: BackoffConfig::default(),
        }
    }
}

const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

impl ListenerConfig {
    /// Loads a configuration from `SQS_LISTENER_*` environment variables,
    /// using defaults for anything unset.
    ///
    /// Recognised variables: `SQS_LISTENER_MAX_MESSAGES`,
    /// `SQS_LISTENER_WAIT_TIME_SECONDS`, `SQS_LISTENER_VISIBILITY_TIMEOUT_SECONDS`,
    /// `SQS_LISTENER_POLL_INTERVAL_MILLIS`, `SQS_LISTENER_DELETION_POLICY`,
    /// `SQS_LISTENER_PAYLOAD_FORMAT`, `SQS_LISTENER_DEAD_LETTER_QUEUE` and
    /// `SQS_LISTENER_MAX_RECEIVE_COUNT`.
    pub fn from_env() -> Result<Self, SqsListenerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SqsListenerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ListenerConfig::default();

        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_MAX_MESSAGES")? {
            config.max_number_of_messages = value;
        }
        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_WAIT_TIME_SECONDS")? {
            config.wait_time_seconds = value;
        }
        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_VISIBILITY_TIMEOUT_SECONDS")? {
            config.visibility_timeout_seconds = Some(value);
        }
        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_POLL_INTERVAL_MILLIS")? {
            config.poll_interval_millis = value;
        }
        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_DELETION_POLICY")? {
            config.deletion_policy = value;
        }
        if let Some(value) = parse_var(&lookup, "SQS_LISTENER_PAYLOAD_FORMAT")? {
            config.payload_format = value;
        }
        if let Some(queue) = lookup("SQS_LISTENER_DEAD_LETTER_QUEUE") {
            config.dead_letter = Some(DeadLetterConfig {
                queue: QueueRef::parse(&queue),
                max_receive_count: parse_var(&lookup, "SQS_LISTENER_MAX_RECEIVE_COUNT")?,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks every value against the limits SQS enforces.
    pub fn validate(&self) -> Result<(), SqsListenerError> {
        if !(1..=10).contains(&self.max_number_of_messages) {
            return Err(invalid(format!(
                "max_number_of_messages must be between 1 and 10, got {}",
                self.max_number_of_messages
            )));
        }
        if !(0..=20).contains(&self.wait_time_seconds) {
            return Err(invalid(format!(
                "wait_time_seconds must be between 0 and 20, got {}",
                self.wait_time_seconds
            )));
        }
        for (field, value) in [
            ("visibility_timeout_seconds", self.visibility_timeout_seconds),
            (
                "failure_visibility_timeout_seconds",
                self.failure_visibility_timeout_seconds,
            ),
        ] {
            if let Some(value) = value {
                if !(0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&value) {
                    return Err(invalid(format!(
                        "{field} must be between 0 and {MAX_VISIBILITY_TIMEOUT_SECONDS}, got {value}"
                    )));
                }
            }
        }
        if let DispatchMode::Parallel { max_concurrency: 0 } = self.dispatch_mode {
            return Err(invalid("parallel dispatch needs max_concurrency > 0".to_string()));
        }
        if let Some(DeadLetterConfig {
            max_receive_count: Some(0),
            ..
        }) = self.dead_letter
        {
            return Err(invalid("dead_letter.max_receive_count must be > 0".to_string()));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(invalid(
                "backoff.initial_delay_ms must not exceed backoff.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Request parameters for one receive call.
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_number_of_messages: self.max_number_of_messages,
            wait_time_seconds: self.wait_time_seconds,
            visibility_timeout_seconds: self.visibility_timeout_seconds,
        }
    }
}

fn invalid(message: String) -> SqsListenerError {
    SqsListenerError::ConfigurationError(message)
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, SqsListenerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_sqs_long_polling() {
        let config = ListenerConfig::default();
        assert_eq!(config.max_number_of_messages, 10);
        assert_eq!(config.wait_time_seconds, 20);
        assert_eq!(config.deletion_policy, DeletionPolicy::OnSuccess);
        assert_eq!(config.dispatch_mode, DispatchMode::Sequential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = ListenerConfig {
            max_number_of_messages: 11,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());

        let config = ListenerConfig {
            wait_time_seconds: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ListenerConfig {
            dispatch_mode: DispatchMode::Parallel { max_concurrency: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_document() {
        let config: ListenerConfig = serde_json::from_str(
            r#"{
                "wait_time_seconds": 5,
                "deletion_policy": "never",
                "payload_format": "json",
                "dispatch_mode": { "mode": "parallel", "max_concurrency": 4 },
                "dead_letter": { "queue": "orders-dlq", "max_receive_count": 3 },
                "backoff": { "max_retries": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.wait_time_seconds, 5);
        assert_eq!(config.max_number_of_messages, 10);
        assert_eq!(config.deletion_policy, DeletionPolicy::Never);
        assert_eq!(config.payload_format, PayloadFormat::Json);
        assert_eq!(
            config.dispatch_mode,
            DispatchMode::Parallel { max_concurrency: 4 }
        );
        assert_eq!(
            config.dead_letter,
            Some(DeadLetterConfig {
                queue: QueueRef::Name("orders-dlq".to_string()),
                max_receive_count: Some(3),
            })
        );
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.backoff.initial_delay_ms, 100);
    }

    #[test]
    fn loads_from_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SQS_LISTENER_MAX_MESSAGES", "5"),
            ("SQS_LISTENER_WAIT_TIME_SECONDS", "1"),
            ("SQS_LISTENER_DELETION_POLICY", "manual"),
            ("SQS_LISTENER_PAYLOAD_FORMAT", "auto"),
            ("SQS_LISTENER_DEAD_LETTER_QUEUE", "https://sqs.local/000/dlq"),
            ("SQS_LISTENER_MAX_RECEIVE_COUNT", "4"),
        ]);
        let config =
            ListenerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.max_number_of_messages, 5);
        assert_eq!(config.wait_time_seconds, 1);
        assert_eq!(config.deletion_policy, DeletionPolicy::Never);
        assert_eq!(config.payload_format, PayloadFormat::Auto);
        let dead_letter = config.dead_letter.unwrap();
        assert_eq!(
            dead_letter.queue,
            QueueRef::Url("https://sqs.local/000/dlq".to_string())
        );
        assert_eq!(dead_letter.max_receive_count, Some(4));
    }

    #[test]
    fn unparseable_variable_is_configuration_error() {
        let result = ListenerConfig::from_lookup(|key| {
            (key == "SQS_LISTENER_MAX_MESSAGES").then(|| "lots".to_string())
        });
        assert!(matches!(
            result,
            Err(SqsListenerError::ConfigurationError(_))
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(20), Duration::from_millis(5000));
    }
}
