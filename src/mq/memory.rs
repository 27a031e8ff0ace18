//! In-process message queue backend
//!
//! Each topic keeps a bounded log plus one delivery queue per consumer group.
//! A group created after messages were published starts from the retained
//! log. Within a group, ready messages are delivered lowest priority value
//! first, FIFO within a priority; members of a group compete for messages.

use super::consumer::{self, BatchSource};
use super::{DeadLetterEntry, MessageHandler, MessageQueue, MqError, MqMessage, Topic, TopicStats};
use crate::config::MqSection;
use crate::observability::metrics::metrics;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Queued {
    message: MqMessage,
    available_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Keyed by (priority, sequence) so iteration order is delivery order
    ready: BTreeMap<(u8, u64), Queued>,
    in_flight: HashMap<String, MqMessage>,
}

impl GroupState {
    fn pending(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }
}

#[derive(Default)]
struct TopicState {
    log: VecDeque<MqMessage>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct State {
    topics: HashMap<Topic, TopicState>,
    dead_letters: Vec<DeadLetterEntry>,
}

struct Inner {
    config: MqSection,
    connected: AtomicBool,
    sequence: AtomicU64,
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), MqError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MqError::NotConnected)
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Append to the topic log and fan out to every existing group
    fn enqueue(&self, state: &mut State, message: MqMessage, available_at: Instant) {
        let topic_state = state.topics.entry(message.topic).or_default();
        for group in topic_state.groups.values_mut() {
            let key = (message.priority, self.next_sequence());
            group.ready.insert(
                key,
                Queued {
                    message: message.clone(),
                    available_at,
                },
            );
        }
        topic_state.log.push_back(message);
        while topic_state.log.len() > self.config.max_len {
            topic_state.log.pop_front();
        }
    }

    fn ensure_group(&self, topic: Topic, group: &str) {
        let mut state = self.state();
        let topic_state = state.topics.entry(topic).or_default();
        if topic_state.groups.contains_key(group) {
            return;
        }
        let now = Instant::now();
        let mut group_state = GroupState::default();
        for message in &topic_state.log {
            group_state.ready.insert(
                (message.priority, self.next_sequence()),
                Queued {
                    message: message.clone(),
                    available_at: now,
                },
            );
        }
        debug!(
            topic = %topic,
            group = group,
            backlog = group_state.ready.len(),
            "Created consumer group"
        );
        topic_state.groups.insert(group.to_string(), group_state);
    }

    /// Move up to `max` available messages into the group's in-flight set
    fn pull(&self, topic: Topic, group: &str, max: usize) -> Vec<MqMessage> {
        let now = Instant::now();
        let mut state = self.state();
        let Some(group_state) = state
            .topics
            .get_mut(&topic)
            .and_then(|t| t.groups.get_mut(group))
        else {
            return Vec::new();
        };

        let keys: Vec<(u8, u64)> = group_state
            .ready
            .iter()
            .filter(|(_, queued)| queued.available_at <= now)
            .take(max)
            .map(|(key, _)| *key)
            .collect();

        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(queued) = group_state.ready.remove(&key) {
                group_state
                    .in_flight
                    .insert(queued.message.message_id.clone(), queued.message.clone());
                batch.push(queued.message);
            }
        }
        batch
    }

    /// Time until the earliest delayed message in the group becomes available
    fn next_available_in(&self, topic: Topic, group: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state();
        state
            .topics
            .get(&topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.ready.values().map(|q| q.available_at).min())
            .map(|at| at.saturating_duration_since(now))
    }

    fn take_in_flight(
        state: &mut State,
        topic: Topic,
        group: &str,
        message_id: &str,
    ) -> Result<MqMessage, MqError> {
        state
            .topics
            .get_mut(&topic)
            .and_then(|t| t.groups.get_mut(group))
            .and_then(|g| g.in_flight.remove(message_id))
            .ok_or_else(|| MqError::UnknownMessage {
                topic: topic.to_string(),
                message_id: message_id.to_string(),
            })
    }

    fn dead_letter(&self, state: &mut State, entry: DeadLetterEntry) -> Result<(), MqError> {
        let payload = serde_json::to_value(&entry)?;
        let notice = MqMessage::new(Topic::DeadLetter, payload, entry.priority);
        warn!(
            original_topic = %entry.original_topic,
            message_id = %entry.message_id,
            retry_count = entry.retry_count,
            error = %entry.error,
            "Message forwarded to dead-letter topic"
        );
        state.dead_letters.push(entry);
        self.enqueue(state, notice, Instant::now());
        metrics().message_dead_lettered();
        Ok(())
    }
}

/// In-memory [`MessageQueue`]; clones share the same queues
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(config: MqSection) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Messages currently retained in a topic's log
    pub fn retained(&self, topic: Topic) -> Vec<MqMessage> {
        self.inner
            .state()
            .topics
            .get(&topic)
            .map(|t| t.log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct MemorySource {
    inner: Arc<Inner>,
    topic: Topic,
    group: String,
}

#[async_trait::async_trait]
impl BatchSource for MemorySource {
    async fn next_batch(&self, max: usize) -> Result<Vec<MqMessage>, MqError> {
        self.inner.ensure_connected()?;
        let batch = self.inner.pull(self.topic, &self.group, max);
        if !batch.is_empty() {
            return Ok(batch);
        }

        let poll_interval = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));
        let wait = self
            .inner
            .next_available_in(self.topic, &self.group)
            .map_or(poll_interval, |d| d.min(poll_interval));
        let _ = tokio::time::timeout(wait, self.inner.notify.notified()).await;

        Ok(self.inner.pull(self.topic, &self.group, max))
    }
}

#[async_trait::async_trait]
impl MessageQueue for MemoryQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<(), MqError> {
        metrics().mq_connection_attempt();
        self.inner.connected.store(true, Ordering::Release);
        metrics().mq_connection_established();
        info!(backend = "memory", "Message queue connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqError> {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
        metrics().mq_connection_lost();
        info!(backend = "memory", "Message queue disconnected");
        Ok(())
    }

    async fn publish(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<String, MqError> {
        if let Err(e) = self.inner.ensure_connected() {
            metrics().publish_failed();
            return Err(e);
        }

        let message = MqMessage::new(topic, payload, priority);
        let message_id = message.message_id.clone();
        let available_at = Instant::now() + delay.unwrap_or_default();
        {
            let mut state = self.inner.state();
            self.inner.enqueue(&mut state, message, available_at);
        }
        self.inner.notify.notify_waiters();
        metrics().message_published();
        debug!(topic = %topic, message_id = %message_id, priority = priority, "Published message");
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        topic: Topic,
        group: &str,
        handler: Arc<dyn MessageHandler>,
        batch_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError> {
        self.inner.ensure_connected()?;
        self.inner.ensure_group(topic, group);
        let source = MemorySource {
            inner: self.inner.clone(),
            topic,
            group: group.to_string(),
        };
        consumer::consume(self, &source, topic, group, handler, batch_size, shutdown).await
    }

    async fn ack(&self, topic: Topic, group: &str, message_id: &str) -> Result<(), MqError> {
        let mut state = self.inner.state();
        Inner::take_in_flight(&mut state, topic, group, message_id)?;
        Ok(())
    }

    async fn nack(
        &self,
        topic: Topic,
        group: &str,
        message_id: &str,
        requeue: bool,
        error: &str,
    ) -> Result<(), MqError> {
        let mut state = self.inner.state();
        let mut message = Inner::take_in_flight(&mut state, topic, group, message_id)?;

        if requeue && message.retry_count < self.inner.config.max_retries {
            message.retry_count += 1;
            let delay = self.inner.config.retry_delay(message.retry_count);
            debug!(
                topic = %topic,
                message_id = %message_id,
                retry_count = message.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Requeueing message"
            );
            let key = (message.priority, self.inner.next_sequence());
            if let Some(group_state) = state
                .topics
                .get_mut(&topic)
                .and_then(|t| t.groups.get_mut(group))
            {
                group_state.ready.insert(
                    key,
                    Queued {
                        message,
                        available_at: Instant::now() + delay,
                    },
                );
            }
            metrics().message_retried();
            return Ok(());
        }

        let entry = DeadLetterEntry {
            message_id: message.message_id,
            original_topic: topic,
            payload: message.payload,
            priority: message.priority,
            error: crate::error::sanitize_error_message(error),
            retry_count: message.retry_count + 1,
            failed_at: Utc::now(),
        };
        self.inner.dead_letter(&mut state, entry)?;
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn pending_count(&self, topic: Topic, group: &str) -> Result<usize, MqError> {
        Ok(self
            .inner
            .state()
            .topics
            .get(&topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, GroupState::pending))
    }

    async fn dead_letter_count(&self) -> Result<usize, MqError> {
        Ok(self.inner.state().dead_letters.len())
    }

    async fn publish_to_dead_letter(
        &self,
        original_topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        error: &str,
        retry_count: u32,
    ) -> Result<(), MqError> {
        self.inner.ensure_connected()?;
        let entry = DeadLetterEntry {
            message_id: uuid::Uuid::new_v4().to_string(),
            original_topic,
            payload,
            priority,
            error: crate::error::sanitize_error_message(error),
            retry_count,
            failed_at: Utc::now(),
        };
        {
            let mut state = self.inner.state();
            self.inner.dead_letter(&mut state, entry)?;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, MqError> {
        Ok(self.inner.state().dead_letters.clone())
    }

    async fn replay_dead_letter(&self, index: usize) -> Result<String, MqError> {
        self.inner.ensure_connected()?;
        let entry = {
            let mut state = self.inner.state();
            if index >= state.dead_letters.len() {
                return Err(MqError::UnknownDeadLetter(index));
            }
            state.dead_letters.remove(index)
        };
        info!(
            original_topic = %entry.original_topic,
            message_id = %entry.message_id,
            "Replaying dead-letter entry"
        );
        self.publish(entry.original_topic, entry.payload, entry.priority, None)
            .await
    }

    async fn topic_stats(&self) -> Result<Vec<TopicStats>, MqError> {
        let state = self.inner.state();
        Ok(Topic::ALL
            .iter()
            .map(|&topic| {
                let (length, pending) = state.topics.get(&topic).map_or((0, 0), |t| {
                    (t.log.len(), t.groups.values().map(GroupState::pending).sum())
                });
                TopicStats {
                    topic,
                    length,
                    pending,
                    dead_letters: state
                        .dead_letters
                        .iter()
                        .filter(|e| e.original_topic == topic)
                        .count(),
                }
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}
