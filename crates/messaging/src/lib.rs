//! Reliable producer/consumer core for a log-structured broker (Kafka via
//! rdkafka): synchronous all-replica-acked sends, at-least-once consumption
//! with bounded retry and dead-letter routing, link supervision, and graceful
//! shutdown. Offsets are committed manually, only after a message has been
//! handled or routed to the DLQ.

mod client;
mod connection;
mod consumer;
pub mod headers;
mod producer;

pub use client::Client;
pub use connection::Connection;
pub use consumer::{Consumer, DlqSink};
pub use producer::Producer;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Message handler: Endpoint-shaped, invoked once per delivery attempt.
/// Must be safe for concurrent invocation.
pub type Handler =
    Arc<dyn Fn(Message) -> futures::future::BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message topic is empty")]
    EmptyTopic,
    #[error("nil message")]
    NilMessage,
    #[error("consumer group id is empty")]
    EmptyGroup,
    #[error("messaging client is closed")]
    Closed,
    #[error("no active consumer session")]
    NoActiveSession,
    #[error("message has no partition/offset to commit")]
    Uncommittable,
    #[error(transparent)]
    Context(#[from] endpoint::Error),
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// One broker record. `partition`, `offset` and `timestamp` are
/// server-assigned and populated only on messages returned from a successful
/// send, or on messages delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: BTreeMap::new(),
            partition: None,
            offset: None,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.topic.is_empty() {
            return Err(Error::EmptyTopic);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub brokers: Vec<String>,
    pub client_id: Option<String>,
    /// Pause between link probes, and between consume-loop restarts.
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Consecutive failed probes before the watchdog gives up; -1 is unbounded.
    pub max_reconnect_attempts: i32,
    #[serde(with = "humantime_serde")]
    pub metadata_timeout: Duration,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: None,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: -1,
            metadata_timeout: Duration::from_secs(5),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Upper bound on a single delivery, including broker-side retries.
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Where to begin when the group has no committed offset.
    pub offset_reset: String,
    pub dlq: Option<DlqConfig>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            offset_reset: "earliest".to_string(),
            dlq: None,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Explicit dead-letter topic; defaults to `<original topic>-dlq`.
    pub topic: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_topic_is_rejected() {
        let message = Message::new("", "payload");
        assert!(matches!(message.validate(), Err(Error::EmptyTopic)));
        assert!(Message::new("orders", "payload").validate().is_ok());
    }

    #[test]
    fn config_merge_leaves_defaults_for_absent_fields() {
        let config: Config =
            serde_json::from_str(r#"{"brokers": ["k1:9092"], "consumer": {"max_retries": 5}}"#)
                .unwrap();
        assert_eq!(config.brokers, vec!["k1:9092"]);
        assert_eq!(config.consumer.max_retries, 5);
        // Untouched fields keep production defaults.
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, -1);
        assert_eq!(config.consumer.retry_interval, Duration::from_secs(1));
    }
}
