//! Message queue abstraction
//!
//! Stages talk to each other only through a [`MessageQueue`]: topic based
//! pub/sub with consumer groups, explicit ack/nack, delayed redelivery and a
//! shared dead-letter topic. Delivery is at-least-once, so every handler must
//! be idempotent (units are keyed by `content_hash`).
//!
//! Two backends exist: [`memory::MemoryQueue`] for single-process deployments
//! and tests, and [`mqtt::MqttQueue`] for an MQTT v5 broker. The backend is
//! chosen once at startup by [`connect_backend`].

pub mod consumer;
pub mod memory;
pub mod mqtt;

use crate::config::{MqBackendKind, MqSection};
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Pipeline topics, in flow order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Raw,
    Processed,
    Pending,
    Review,
    Knowledge,
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Raw,
        Topic::Processed,
        Topic::Pending,
        Topic::Review,
        Topic::Knowledge,
        Topic::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Raw => "raw",
            Topic::Processed => "processed",
            Topic::Pending => "pending",
            Topic::Review => "review",
            Topic::Knowledge => "knowledge",
            Topic::DeadLetter => "dead_letter",
        }
    }

    /// Topic name as seen by the backend
    pub fn qualified(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| MqError::UnknownTopic(s.to_string()))
    }
}

/// Envelope for every message on every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqMessage {
    pub message_id: String,
    pub topic: Topic,
    pub payload: serde_json::Value,
    /// 0 is delivered first
    pub priority: u8,
    /// Failed deliveries so far
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl MqMessage {
    pub fn new(topic: Topic, payload: serde_json::Value, priority: u8) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            topic,
            payload,
            priority,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Deserialize the payload; a malformed payload is a validation failure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            PipelineError::validation(format!(
                "malformed {} payload in message {}: {e}",
                self.topic, self.message_id
            ))
        })
    }
}

/// A message that exhausted its retries or was explicitly rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub original_topic: Topic,
    pub payload: serde_json::Value,
    pub priority: u8,
    /// Sanitized text of the error that caused the forward
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Per-topic queue depth snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStats {
    pub topic: Topic,
    /// Messages retained in the topic log
    pub length: usize,
    /// Delivered-or-waiting messages not yet acked, summed over groups
    pub pending: usize,
    /// Dead-letter entries that originated on this topic
    pub dead_letters: usize,
}

/// Message queue errors
#[derive(Debug, Error)]
pub enum MqError {
    #[error("Message queue is not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Unknown message {message_id} on topic {topic}")]
    UnknownMessage { topic: String, message_id: String },
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Dead-letter entry {0} does not exist")]
    UnknownDeadLetter(usize),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MqError {
    /// Whether the same operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MqError::NotConnected
                | MqError::ConnectionFailed(_)
                | MqError::PublishFailed(_)
                | MqError::SubscriptionFailed(_)
        )
    }
}

/// Consumer callback; `Ok` acks, a retryable `Err` requeues, any other `Err`
/// dead-letters the message
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &MqMessage) -> Result<(), PipelineError>;
}

/// Topic/consumer-group message queue
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    /// Backend name for logs and health output
    fn backend_name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), MqError>;

    async fn disconnect(&self) -> Result<(), MqError>;

    /// Publish a payload, optionally delayed; returns the message id
    async fn publish(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<String, MqError>;

    /// Consume `topic` as a member of `group` until `shutdown` flips to true.
    /// Each pulled batch is handled concurrently and fully settled before the
    /// next pull, so returning after shutdown leaves nothing in flight.
    async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        batch_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError>;

    async fn ack(&self, topic: Topic, group: &str, message_id: &str) -> Result<(), MqError>;

    /// Reject a delivery. With `requeue` the message is redelivered after a
    /// backoff unless it has used up its retries; otherwise, or once retries
    /// are exhausted, it is forwarded to the dead-letter topic with `error`.
    async fn nack(
        &self,
        topic: Topic,
        group: &str,
        message_id: &str,
        requeue: bool,
        error: &str,
    ) -> Result<(), MqError>;

    /// Messages of `topic` not yet acked by `group`
    async fn pending_count(&self, topic: Topic, group: &str) -> Result<usize, MqError>;

    async fn dead_letter_count(&self) -> Result<usize, MqError>;

    async fn publish_to_dead_letter(
        &self,
        original_topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        error: &str,
        retry_count: u32,
    ) -> Result<(), MqError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, MqError>;

    /// Remove a dead-letter entry and republish it to its original topic
    async fn replay_dead_letter(&self, index: usize) -> Result<String, MqError>;

    async fn topic_stats(&self) -> Result<Vec<TopicStats>, MqError>;

    /// Never errors; false means the backend is unusable right now
    async fn health_check(&self) -> bool;
}

/// Build the configured backend; unsupported names fail here, at startup
pub fn connect_backend(config: &MqSection) -> Result<Arc<dyn MessageQueue>, PipelineError> {
    match config.backend_kind()? {
        MqBackendKind::Memory => Ok(Arc::new(memory::MemoryQueue::new(config.clone()))),
        MqBackendKind::Mqtt => {
            let queue = mqtt::MqttQueue::new(config.clone())?;
            Ok(Arc::new(queue))
        }
    }
}
