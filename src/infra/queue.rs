//! Delayed message plumbing for deferred cache deletes.
//!
//! Messages enter on the delay topic and sit there until the configured
//! delay has elapsed. A forwarder task owned by this crate moves due
//! messages onto the ready topic, where consumer groups pick them up.
//! Messages that linger past `delay * drop_multiple` are acknowledged
//! without forwarding so a stalled forwarder cannot replay a storm of
//! ancient deletes after recovery.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::config::BrokerSettings;

const SOURCE: &str = "infra::queue";

/// Topic holding not-yet-due deferred messages.
pub const DELAY_TOPIC: &str = "cache.delay";
/// Topic holding messages whose delay has elapsed.
pub const READY_TOPIC: &str = "cache.ready";
/// Consumer group reserved for the internal forwarder task.
pub const FORWARDER_GROUP: &str = "delay.forwarder";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("consumer group `{group}` is reserved for the delay forwarder")]
    ReservedGroup { group: String },
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A message leased to a consumer until it is acked, nacked, or its
/// visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub payload: String,
    pub receive_count: u32,
}

/// Minimal publish/subscribe seam so the delay pipeline can run against
/// an external broker in deployments that have one.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    /// Leases the oldest visible message in the group queue, hiding it
    /// for `visibility` so concurrent consumers do not double-process.
    async fn receive(
        &self,
        topic: &str,
        group: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Removes a leased message. Returns `false` when the id is gone.
    async fn ack(&self, topic: &str, group: &str, id: Uuid) -> Result<bool, BrokerError>;

    /// Returns a leased message to the queue for immediate redelivery.
    async fn nack(&self, topic: &str, group: &str, id: Uuid) -> Result<bool, BrokerError>;
}

#[derive(Debug)]
struct QueuedMessage {
    id: Uuid,
    payload: String,
    visible_at: Option<Instant>,
    receive_count: u32,
}

impl QueuedMessage {
    fn is_visible(&self, now: Instant) -> bool {
        match self.visible_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

type GroupQueues = HashMap<String, VecDeque<QueuedMessage>>;

/// Process-local broker. Each subscribed group receives its own copy of
/// every published message, mirroring how a shared broker fans out to
/// consumer groups.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, Mutex<GroupQueues>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let id = Uuid::new_v4();
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        let mut groups = mutex_lock(&entry, SOURCE, "publish");
        if groups.is_empty() {
            debug!(topic, "published to topic with no subscribed groups");
        }
        for queue in groups.values_mut() {
            queue.push_back(QueuedMessage {
                id,
                payload: payload.to_string(),
                visible_at: None,
                receive_count: 0,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        let mut groups = mutex_lock(&entry, SOURCE, "subscribe");
        groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let Some(entry) = self.topics.get(topic) else {
            return Ok(None);
        };
        let mut groups = mutex_lock(&entry, SOURCE, "receive");
        let Some(queue) = groups.get_mut(group) else {
            return Ok(None);
        };
        let now = Instant::now();
        for message in queue.iter_mut() {
            if message.is_visible(now) {
                message.visible_at = Some(now + visibility);
                message.receive_count += 1;
                return Ok(Some(Delivery {
                    id: message.id,
                    payload: message.payload.clone(),
                    receive_count: message.receive_count,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, topic: &str, group: &str, id: Uuid) -> Result<bool, BrokerError> {
        let Some(entry) = self.topics.get(topic) else {
            return Ok(false);
        };
        let mut groups = mutex_lock(&entry, SOURCE, "ack");
        let Some(queue) = groups.get_mut(group) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|message| message.id != id);
        Ok(queue.len() < before)
    }

    async fn nack(&self, topic: &str, group: &str, id: Uuid) -> Result<bool, BrokerError> {
        let Some(entry) = self.topics.get(topic) else {
            return Ok(false);
        };
        let mut groups = mutex_lock(&entry, SOURCE, "nack");
        let Some(queue) = groups.get_mut(group) else {
            return Ok(false);
        };
        for message in queue.iter_mut() {
            if message.id == id {
                message.visible_at = None;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Wire form of a deferred message. The enqueue timestamp travels with
/// the payload so age survives broker restarts and redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

/// Client for the delay pipeline: producers call [`DelayQueue::send`],
/// consumers register a group via [`DelayQueue::consume`], and one
/// forwarder task per process moves due messages across.
#[derive(Clone)]
pub struct DelayQueue {
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
}

impl DelayQueue {
    pub async fn new(
        broker: Arc<dyn Broker>,
        settings: BrokerSettings,
    ) -> Result<Self, BrokerError> {
        broker.subscribe(DELAY_TOPIC, FORWARDER_GROUP).await?;
        Ok(Self { broker, settings })
    }

    /// Publishes a message that becomes consumable once the configured
    /// delay has elapsed.
    pub async fn send(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let envelope = Envelope {
            key: key.to_string(),
            value: value.to_string(),
            enqueued_at: OffsetDateTime::now_utc(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.broker.publish(DELAY_TOPIC, &payload).await
    }

    /// Starts the forwarder loop. Run exactly one per process; the
    /// reserved consumer group makes a second instance share (and
    /// split) the same queue rather than duplicate deliveries.
    pub fn spawn_forwarder(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match queue.forward_step().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(queue.settings.poll_interval).await,
                    Err(error) => {
                        warn!(error = %error, "delay forwarder step failed");
                        tokio::time::sleep(queue.settings.poll_interval).await;
                    }
                }
            }
        })
    }

    /// Registers `group` on the ready topic and spawns a consumer loop
    /// that acks on handler success and nacks on failure.
    pub async fn consume<F, Fut, E>(
        &self,
        group: &str,
        handler: F,
    ) -> Result<JoinHandle<()>, BrokerError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display + Send + 'static,
    {
        if group == FORWARDER_GROUP {
            return Err(BrokerError::ReservedGroup {
                group: group.to_string(),
            });
        }
        self.broker.subscribe(READY_TOPIC, group).await?;
        let queue = self.clone();
        let group = group.to_string();
        Ok(tokio::spawn(async move {
            loop {
                match queue.consume_step(&group, &handler).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(queue.settings.poll_interval).await,
                    Err(error) => {
                        warn!(group, error = %error, "ready consumer step failed");
                        tokio::time::sleep(queue.settings.poll_interval).await;
                    }
                }
            }
        }))
    }

    /// Examines the oldest leased delay message. Returns `Ok(true)` when
    /// it made progress (forwarded or dropped something) and `Ok(false)`
    /// when the queue is empty or the head message is not due yet.
    async fn forward_step(&self) -> Result<bool, BrokerError> {
        let visibility = self.settings.visibility_timeout;
        let Some(delivery) = self
            .broker
            .receive(DELAY_TOPIC, FORWARDER_GROUP, visibility)
            .await?
        else {
            return Ok(false);
        };

        let envelope: Envelope = match serde_json::from_str(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(error = %error, "acking undecodable delayed message");
                self.broker
                    .ack(DELAY_TOPIC, FORWARDER_GROUP, delivery.id)
                    .await?;
                return Ok(true);
            }
        };

        let age_ms = (OffsetDateTime::now_utc() - envelope.enqueued_at).whole_milliseconds();
        let delay_ms = self.settings.delay.as_millis() as i128;
        let drop_after_ms = delay_ms * i128::from(self.settings.drop_multiple.get());

        if age_ms >= drop_after_ms {
            warn!(
                key = %envelope.key,
                age_ms,
                "dropping overdue delayed message without forwarding"
            );
            counter!("ateneo_delay_dropped_total").increment(1);
            self.broker
                .ack(DELAY_TOPIC, FORWARDER_GROUP, delivery.id)
                .await?;
            return Ok(true);
        }

        if age_ms >= delay_ms {
            self.broker.publish(READY_TOPIC, &delivery.payload).await?;
            self.broker
                .ack(DELAY_TOPIC, FORWARDER_GROUP, delivery.id)
                .await?;
            counter!("ateneo_delay_forwarded_total").increment(1);
            return Ok(true);
        }

        // Not due. The lease lapses after the visibility timeout and the
        // message comes back on a later poll.
        Ok(false)
    }

    async fn consume_step<F, Fut, E>(&self, group: &str, handler: &F) -> Result<bool, BrokerError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
    {
        let visibility = self.settings.visibility_timeout;
        let Some(delivery) = self.broker.receive(READY_TOPIC, group, visibility).await? else {
            return Ok(false);
        };

        let envelope: Envelope = match serde_json::from_str(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(group, error = %error, "acking undecodable ready message");
                self.broker.ack(READY_TOPIC, group, delivery.id).await?;
                return Ok(true);
            }
        };

        match handler(envelope).await {
            Ok(()) => {
                self.broker.ack(READY_TOPIC, group, delivery.id).await?;
                Ok(true)
            }
            Err(error) => {
                warn!(
                    group,
                    error = %error,
                    receive_count = delivery.receive_count,
                    "ready handler failed, message returns to the queue"
                );
                self.broker.nack(READY_TOPIC, group, delivery.id).await?;
                Ok(false)
            }
        }
    }
}
