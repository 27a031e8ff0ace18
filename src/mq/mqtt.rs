//! MQTT v5 message queue backend
//!
//! Consumer groups map onto MQTT v5 shared subscriptions
//! (`$share/<group>/<topic>`), so every process subscribing with the same
//! group competes for messages. Messages are published with QoS 1 and acked
//! manually: a delivery is acked to the broker only once the handler's
//! outcome is settled, so a crash before settling leads to redelivery.
//!
//! Retries are republished copies of the envelope with an incremented
//! `retry_count`; the broker delivery is acked after the copy is out.
//!
//! The event-loop task is the only reader of the client's bounded request
//! channel, so it never awaits a client request itself. Acks, dead-letter
//! publishes and resubscriptions it needs are queued on an unbounded outbox
//! and sent by a separate task.
//! The broker exposes no queue depth, so `pending_count`, `topic_stats` and
//! the dead-letter list describe what this process has seen.

use super::consumer::{self, BatchSource};
use super::{DeadLetterEntry, MessageHandler, MessageQueue, MqError, MqMessage, Topic, TopicStats};
use crate::config::{MqSection, MqttSection};
use crate::observability::metrics::metrics;
use chrono::Utc;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Connection state for the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnection attempts exhausted
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250, 1000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Build client options from the broker section
pub fn configure_mqtt_options(
    config: &MqttSection,
    username: Option<String>,
    password: Option<String>,
) -> Result<MqttOptions, MqError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| MqError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique per connection so a restarted process never collides with its old session
    let client_id = format!("{}-{}", config.client_id, uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }
    if let Some(username) = username {
        mqtt_options.set_credentials(username, password.unwrap_or_default());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_max_packet_size(Some(1024 * 1024));
    mqtt_options.set_manual_acks(true);

    Ok(mqtt_options)
}

/// Shared-subscription filter for a consumer group
pub fn shared_filter(group: &str, qualified_topic: &str) -> String {
    format!("$share/{group}/{qualified_topic}")
}

struct Route {
    group: String,
    sender: mpsc::UnboundedSender<MqMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<MqMessage>>>,
}

struct InFlight {
    topic: Topic,
    publish: Publish,
    message: MqMessage,
}

/// Broker requests raised by the event loop
#[derive(Debug)]
enum Outbound {
    Ack(Publish),
    /// Publish the entry, then ack the delivery it came from
    DeadLetter { entry: DeadLetterEntry, ack: Publish },
    Resubscribe,
}

fn enqueue(outbox: &mpsc::UnboundedSender<Outbound>, request: Outbound) {
    if let Err(e) = outbox.send(request) {
        warn!(request = ?e.0, "Outbox closed, dropping broker request");
    }
}

/// State shared between the queue handle and its event-loop task
struct Shared {
    config: MqSection,
    client: Mutex<Option<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    routes: Mutex<HashMap<Topic, Route>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
    received: Mutex<HashMap<Topic, usize>>,
}

impl Shared {
    fn new(config: MqSection, state_tx: watch::Sender<ConnectionState>) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            state_tx,
            routes: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            received: Mutex::new(HashMap::new()),
        }
    }

    fn topic_of(&self, qualified: &str) -> Option<Topic> {
        qualified
            .strip_prefix(&self.config.topic_prefix)
            .and_then(|name| name.parse().ok())
    }

    async fn client(&self) -> Result<AsyncClient, MqError> {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return Err(MqError::NotConnected);
        }
        self.client.lock().await.clone().ok_or(MqError::NotConnected)
    }

    async fn publish_message(&self, message: &MqMessage) -> Result<(), MqError> {
        let client = self.client().await?;
        let payload = serde_json::to_vec(message)?;
        let topic = message.topic.qualified(&self.config.topic_prefix);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| {
                metrics().publish_failed();
                MqError::PublishFailed(e.to_string())
            })?;
        metrics().message_published();
        Ok(())
    }

    async fn broker_ack(&self, publish: &Publish) -> Result<(), MqError> {
        let client = self.client().await?;
        client
            .ack(publish)
            .await
            .map_err(|e| MqError::ConnectionFailed(e.to_string()))
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), MqError> {
        warn!(
            original_topic = %entry.original_topic,
            message_id = %entry.message_id,
            retry_count = entry.retry_count,
            error = %entry.error,
            "Message forwarded to dead-letter topic"
        );
        let notice = MqMessage::new(
            Topic::DeadLetter,
            serde_json::to_value(&entry)?,
            entry.priority,
        );
        self.publish_message(&notice).await?;
        self.dead_letters.lock().await.push(entry);
        metrics().message_dead_lettered();
        Ok(())
    }

    /// Hand an inbound publish to the local subscriber of its topic
    async fn route_publish(&self, publish: Publish, outbox: &mpsc::UnboundedSender<Outbound>) {
        let qualified = String::from_utf8_lossy(&publish.topic).to_string();
        let Some(topic) = self.topic_of(&qualified) else {
            warn!(topic = %qualified, "Received message on unexpected topic");
            enqueue(outbox, Outbound::Ack(publish));
            return;
        };

        let message: MqMessage = match serde_json::from_slice(&publish.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(topic = %qualified, error = %e, "Dropping undecodable envelope");
                let raw = String::from_utf8_lossy(&publish.payload).to_string();
                let entry = DeadLetterEntry {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    original_topic: topic,
                    payload: serde_json::Value::String(raw),
                    priority: 0,
                    error: crate::error::sanitize_error_message(&e.to_string()),
                    retry_count: 0,
                    failed_at: Utc::now(),
                };
                enqueue(outbox, Outbound::DeadLetter { entry, ack: publish });
                return;
            }
        };

        *self.received.lock().await.entry(topic).or_default() += 1;

        let routes = self.routes.lock().await;
        let Some(route) = routes.get(&topic) else {
            debug!(topic = %topic, "No local subscriber; leaving message unacked");
            return;
        };

        self.in_flight.lock().await.insert(
            message.message_id.clone(),
            InFlight {
                topic,
                publish,
                message: message.clone(),
            },
        );
        if route.sender.send(message).is_err() {
            warn!(topic = %topic, "Subscriber channel closed");
        }
    }

    async fn resubscribe(&self) {
        let Ok(client) = self.client().await else {
            return;
        };
        let filters: Vec<String> = self
            .routes
            .lock()
            .await
            .iter()
            .map(|(topic, route)| {
                shared_filter(&route.group, &topic.qualified(&self.config.topic_prefix))
            })
            .collect();
        for filter in filters {
            if let Err(e) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                warn!(filter = %filter, error = %e, "Failed to resubscribe");
            }
        }
    }

    /// Send queued broker requests until the event loop drops its sender
    async fn run_outbox(self: Arc<Self>, mut outbox: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(request) = outbox.recv().await {
            match request {
                Outbound::Ack(publish) => {
                    if let Err(e) = self.broker_ack(&publish).await {
                        debug!(error = %e, "Ack not delivered; broker will redeliver");
                    }
                }
                Outbound::DeadLetter { entry, ack } => {
                    if let Err(e) = self.dead_letter(entry).await {
                        warn!(error = %e, "Failed to dead-letter undecodable envelope");
                    }
                    if let Err(e) = self.broker_ack(&ack).await {
                        debug!(error = %e, "Ack not delivered; broker will redeliver");
                    }
                }
                Outbound::Resubscribe => self.resubscribe().await,
            }
        }
        debug!("MQTT outbox stopped");
    }
}

/// MQTT v5 [`MessageQueue`]
pub struct MqttQueue {
    shared: Arc<Shared>,
    broker: MqttSection,
    reconnect: ReconnectConfig,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttQueue {
    pub fn new(config: MqSection) -> Result<Self, MqError> {
        let broker = config
            .mqtt
            .clone()
            .ok_or_else(|| MqError::ConnectionFailed("missing [mq.mqtt] section".to_string()))?;
        // Validate the URL up front so a bad config fails at startup
        configure_mqtt_options(&broker, None, None)?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Ok(Self {
            shared: Arc::new(Shared::new(config, state_tx)),
            broker,
            reconnect: ReconnectConfig::default(),
            state_rx,
            shutdown_tx: Mutex::new(None),
            event_loop_handle: Mutex::new(None),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Wait for the broker's ConnAck
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqError::ConnectionFailed(reason.clone()));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqError::ConnectionFailed("state channel closed".to_string()));
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => Err(MqError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Sleep unless shutdown is requested first; false means stop
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    async fn run_event_loop(
        shared: Arc<Shared>,
        mut event_loop: EventLoop,
        outbox: mpsc::UnboundedSender<Outbound>,
        reconnect: ReconnectConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempts = 0;
                        let _ = shared.state_tx.send(ConnectionState::Connected);
                        metrics().mq_connection_established();
                        info!("MQTT connection acknowledged");
                        enqueue(&outbox, Outbound::Resubscribe);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared.route_publish(publish, &outbox).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        metrics().mq_connection_lost();
                        let _ = shared
                            .state_tx
                            .send(ConnectionState::Disconnected("disconnected by broker".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        attempts += 1;
                        metrics().mq_connection_lost();
                        metrics().mq_connection_attempt();
                        if reconnect.attempts_exhausted(attempts) {
                            error!(error = %e, attempts = attempts, "MQTT reconnection attempts exhausted");
                            let _ = shared
                                .state_tx
                                .send(ConnectionState::PermanentlyDisconnected(e.to_string()));
                            break;
                        }
                        warn!(error = %e, attempt = attempts, "MQTT connection error, reconnecting");
                        let _ = shared.state_tx.send(ConnectionState::Reconnecting(attempts));
                        let delay = reconnect.calculate_backoff_delay(attempts);
                        if !Self::interruptible_sleep(shutdown_rx.clone(), delay).await {
                            break;
                        }
                    }
                }
            }
        }
        info!("MQTT event loop stopped");
    }

    async fn take_in_flight(&self, topic: Topic, message_id: &str) -> Result<InFlight, MqError> {
        let entry = self
            .shared
            .in_flight
            .lock()
            .await
            .remove(message_id)
            .filter(|f| f.topic == topic)
            .ok_or_else(|| MqError::UnknownMessage {
                topic: topic.to_string(),
                message_id: message_id.to_string(),
            })?;
        Ok(entry)
    }
}

struct MqttSource {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<MqMessage>>>,
    poll_interval: Duration,
}

#[async_trait::async_trait]
impl BatchSource for MqttSource {
    async fn next_batch(&self, max: usize) -> Result<Vec<MqMessage>, MqError> {
        let mut receiver = self.receiver.lock().await;
        let mut batch = Vec::with_capacity(max);
        match tokio::time::timeout(self.poll_interval, receiver.recv()).await {
            Ok(Some(message)) => batch.push(message),
            Ok(None) => return Err(MqError::SubscriptionFailed("channel closed".to_string())),
            Err(_) => return Ok(batch),
        }
        while batch.len() < max {
            match receiver.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl MessageQueue for MqttQueue {
    fn backend_name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> Result<(), MqError> {
        let mut handle_slot = self.event_loop_handle.lock().await;
        if handle_slot.is_some() {
            return Ok(());
        }

        let username = self
            .broker
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        let password = self
            .broker
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        let options = configure_mqtt_options(&self.broker, username, password)?;
        let (client, event_loop) = AsyncClient::new(options, 100);
        *self.shared.client.lock().await = Some(client);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        let _ = self.shared.state_tx.send(ConnectionState::Connecting);
        metrics().mq_connection_attempt();

        info!(broker = %self.broker.broker_url, "Connecting to MQTT broker");
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.shared.clone().run_outbox(outbox_rx));
        *handle_slot = Some(tokio::spawn(Self::run_event_loop(
            self.shared.clone(),
            event_loop,
            outbox_tx,
            self.reconnect.clone(),
            shutdown_rx,
        )));
        drop(handle_slot);

        let timeout = Duration::from_secs(self.broker.connect_timeout_secs.max(1));
        Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await
    }

    async fn disconnect(&self) -> Result<(), MqError> {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(client) = self.shared.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Disconnect request not delivered");
            }
        }
        let _ = self
            .shared
            .state_tx
            .send(ConnectionState::Disconnected("client disconnected".to_string()));

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) => warn!(error = %e, "MQTT event loop ended with error"),
                Err(_) => warn!("MQTT event loop did not stop in time"),
            }
        }
        metrics().mq_connection_lost();
        Ok(())
    }

    async fn publish(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<String, MqError> {
        let message = MqMessage::new(topic, payload, priority);
        let message_id = message.message_id.clone();

        match delay.filter(|d| !d.is_zero()) {
            None => self.shared.publish_message(&message).await?,
            Some(delay) => {
                // Fail fast while disconnected instead of losing the timer later
                self.shared.client().await?;
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = shared.publish_message(&message).await {
                        error!(message_id = %message.message_id, error = %e, "Delayed publish failed");
                    }
                });
            }
        }
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
        let client = self.shared.client().await?;
        let (receiver, is_new) = {
            let mut routes = self.shared.routes.lock().await;
            match routes.get(&topic) {
                Some(route) if route.group != group => {
                    return Err(MqError::SubscriptionFailed(format!(
                        "{topic} is already consumed by group {} in this process",
                        route.group
                    )));
                }
                Some(route) => (route.receiver.clone(), false),
                None => {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    let route = Route {
                        group: group.to_string(),
                        sender,
                        receiver: Arc::new(Mutex::new(receiver)),
                    };
                    let receiver = route.receiver.clone();
                    routes.insert(topic, route);
                    (receiver, true)
                }
            }
        };

        if is_new {
            let filter = shared_filter(group, &topic.qualified(&self.shared.config.topic_prefix));
            client
                .subscribe(filter.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|e| MqError::SubscriptionFailed(e.to_string()))?;
            info!(filter = %filter, "Subscribed");
        }

        let source = MqttSource {
            receiver,
            poll_interval: Duration::from_millis(self.shared.config.poll_interval_ms.max(10)),
        };
        consumer::consume(self, &source, topic, group, handler, batch_size, shutdown).await
    }

    async fn ack(&self, topic: Topic, _group: &str, message_id: &str) -> Result<(), MqError> {
        let in_flight = self.take_in_flight(topic, message_id).await?;
        self.shared.broker_ack(&in_flight.publish).await
    }

    async fn nack(
        &self,
        topic: Topic,
        _group: &str,
        message_id: &str,
        requeue: bool,
        error: &str,
    ) -> Result<(), MqError> {
        let InFlight {
            publish,
            mut message,
            ..
        } = self.take_in_flight(topic, message_id).await?;

        if requeue && message.retry_count < self.shared.config.max_retries {
            message.retry_count += 1;
            let delay = self.shared.config.retry_delay(message.retry_count);
            metrics().message_retried();
            let shared = self.shared.clone();
            // Ack the original only once the retry copy is on the broker
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match shared.publish_message(&message).await {
                    Ok(()) => {
                        if let Err(e) = shared.broker_ack(&publish).await {
                            warn!(error = %e, "Failed to ack retried message");
                        }
                    }
                    Err(e) => {
                        warn!(message_id = %message.message_id, error = %e, "Retry publish failed; broker will redeliver");
                    }
                }
            });
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
        self.shared.dead_letter(entry).await?;
        self.shared.broker_ack(&publish).await
    }

    async fn pending_count(&self, topic: Topic, group: &str) -> Result<usize, MqError> {
        let subscribed = self
            .shared
            .routes
            .lock()
            .await
            .get(&topic)
            .is_some_and(|r| r.group == group);
        if !subscribed {
            return Ok(0);
        }
        // Queued deliveries are registered in flight before they reach the channel
        Ok(self
            .shared
            .in_flight
            .lock()
            .await
            .values()
            .filter(|f| f.topic == topic)
            .count())
    }

    async fn dead_letter_count(&self) -> Result<usize, MqError> {
        Ok(self.shared.dead_letters.lock().await.len())
    }

    async fn publish_to_dead_letter(
        &self,
        original_topic: Topic,
        payload: serde_json::Value,
        priority: u8,
        error: &str,
        retry_count: u32,
    ) -> Result<(), MqError> {
        self.shared
            .dead_letter(DeadLetterEntry {
                message_id: uuid::Uuid::new_v4().to_string(),
                original_topic,
                payload,
                priority,
                error: crate::error::sanitize_error_message(error),
                retry_count,
                failed_at: Utc::now(),
            })
            .await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, MqError> {
        Ok(self.shared.dead_letters.lock().await.clone())
    }

    async fn replay_dead_letter(&self, index: usize) -> Result<String, MqError> {
        let entry = {
            let mut dead_letters = self.shared.dead_letters.lock().await;
            if index >= dead_letters.len() {
                return Err(MqError::UnknownDeadLetter(index));
            }
            dead_letters.remove(index)
        };
        match self
            .publish(entry.original_topic, entry.payload.clone(), entry.priority, None)
            .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                self.shared.dead_letters.lock().await.insert(index, entry);
                Err(e)
            }
        }
    }

    async fn topic_stats(&self) -> Result<Vec<TopicStats>, MqError> {
        let received = self.shared.received.lock().await.clone();
        let dead_letters = self.shared.dead_letters.lock().await.clone();
        let in_flight: Vec<Topic> = self
            .shared
            .in_flight
            .lock()
            .await
            .values()
            .map(|f| f.topic)
            .collect();
        Ok(Topic::ALL
            .iter()
            .map(|&topic| TopicStats {
                topic,
                length: received.get(&topic).copied().unwrap_or(0),
                pending: in_flight.iter().filter(|&&t| t == topic).count(),
                dead_letters: dead_letters.iter().filter(|e| e.original_topic == topic).count(),
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }
}
