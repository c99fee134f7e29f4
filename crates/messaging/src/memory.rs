use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::channel::{EventChannel, MessageHandler};
use crate::envelope::EventEnvelope;
use crate::error::{ChannelError, Result};
use crate::routing::matches;
use crate::topology::{QueueSpec, Topology, dead_letter_queue};

/// A message sitting in (or dead-lettered from) a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Why the message was dead-lettered, if it was.
    pub death_reason: Option<String>,
}

impl QueuedMessage {
    /// Parses the body back into an envelope.
    pub fn envelope(&self) -> Result<EventEnvelope> {
        Ok(EventEnvelope::from_bytes(&self.body)?)
    }
}

/// Record of a publish, kept for inspection.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub routing_key: String,
    pub envelope: EventEnvelope,
}

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    DeadLettered,
}

struct QueueState {
    /// `None` for dead-letter queues, which are never consumed.
    spec: Option<QueueSpec>,
    messages: VecDeque<QueuedMessage>,
    handler: Option<Arc<dyn MessageHandler>>,
    consuming: bool,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: Option<QueueSpec>) -> Self {
        Self {
            spec,
            messages: VecDeque::new(),
            handler: None,
            consuming: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct BrokerState {
    topology: Topology,
    queues: BTreeMap<String, QueueState>,
    published: Vec<PublishedMessage>,
    consumers: Vec<JoinHandle<()>>,
    /// Publishes still to be rejected, see [`InMemoryBroker::fail_publishes`].
    failing_publishes: usize,
}

/// Process-local topic exchange implementing [`EventChannel`].
///
/// Routing, dead-lettering and TTL follow the same [`Topology`] the AMQP
/// channel declares on RabbitMQ, so the saga behaves identically on both.
/// Tests drive delivery deterministically with [`InMemoryBroker::drain`];
/// services call [`EventChannel::start_consuming`] instead.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a broker with every topic, queue and dead-letter queue in
    /// `topology` declared.
    pub fn new(topology: Topology) -> Self {
        let mut queues = BTreeMap::new();
        for spec in &topology.queues {
            queues.insert(spec.dead_letter_queue.clone(), QueueState::new(None));
            queues.insert(spec.name.clone(), QueueState::new(Some(spec.clone())));
        }

        Self {
            state: Arc::new(Mutex::new(BrokerState {
                topology,
                queues,
                published: Vec::new(),
                consumers: Vec::new(),
                failing_publishes: 0,
            })),
        }
    }

    /// Every message published so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Envelopes published with the given event type.
    pub async fn published_of(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.envelope.event_type == event_type)
            .map(|m| m.envelope.clone())
            .collect()
    }

    /// Rejects the next `count` publishes with a broker error, the way an
    /// unreachable broker would.
    pub async fn fail_publishes(&self, count: usize) {
        self.state.lock().await.failing_publishes = count;
    }

    /// Number of messages waiting in `queue`.
    pub async fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages dead-lettered from `queue`.
    pub async fn dead_letters(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state
            .lock()
            .await
            .queues
            .get(&dead_letter_queue(queue))
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Puts an envelope straight onto `queue`, bypassing routing. Simulates
    /// broker redelivery.
    pub async fn redeliver(&self, queue: &str, envelope: &EventEnvelope) -> Result<()> {
        let body = envelope.to_bytes()?;
        let notify = {
            let mut state = self.state.lock().await;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| ChannelError::UnknownQueue(queue.to_string()))?;
            q.messages.push_back(QueuedMessage {
                topic: String::new(),
                routing_key: envelope.event_type.clone(),
                body,
                enqueued_at: Utc::now(),
                death_reason: None,
            });
            q.notify.clone()
        };
        notify.notify_one();
        Ok(())
    }

    /// Delivers queued messages until every subscribed queue is empty.
    ///
    /// Queues are visited round-robin in name order, one message each per
    /// round. Returns the number of deliveries.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let names: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .queues
                    .iter()
                    .filter(|(_, q)| q.handler.is_some())
                    .map(|(name, _)| name.clone())
                    .collect()
            };

            let mut delivered = 0;
            for name in &names {
                if self.deliver_next(name).await.is_some() {
                    delivered += 1;
                }
            }

            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Stops all background consumers.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for handle in state.consumers.drain(..) {
            handle.abort();
        }
        for queue in state.queues.values_mut() {
            queue.consuming = false;
        }
    }

    /// Pops and delivers the next message of `queue`.
    ///
    /// Returns `None` when the queue is empty or has no handler.
    pub async fn deliver_next(&self, queue: &str) -> Option<DeliveryOutcome> {
        let (message, handler, spec) = {
            let mut state = self.state.lock().await;
            let q = state.queues.get_mut(queue)?;
            let handler = q.handler.clone()?;
            let spec = q.spec.clone()?;
            let message = q.messages.pop_front()?;
            (message, handler, spec)
        };

        let age = (Utc::now() - message.enqueued_at)
            .to_std()
            .unwrap_or_default();
        if age >= spec.message_ttl {
            self.dead_letter(&spec, message, "message ttl expired".to_string())
                .await;
            return Some(DeliveryOutcome::DeadLettered);
        }

        match handler.handle(&message.body).await {
            Ok(()) => Some(DeliveryOutcome::Acked),
            Err(e) => {
                self.dead_letter(&spec, message, e.to_string()).await;
                Some(DeliveryOutcome::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, spec: &QueueSpec, mut message: QueuedMessage, reason: String) {
        tracing::warn!(
            queue = %spec.name,
            routing_key = %message.routing_key,
            %reason,
            "message dead-lettered"
        );
        metrics::counter!("events_dead_lettered_total", "queue" => spec.name.clone()).increment(1);

        message.death_reason = Some(reason);
        let mut state = self.state.lock().await;
        if let Some(dlq) = state.queues.get_mut(&spec.dead_letter_queue) {
            dlq.messages.push_back(message);
        }
    }

    async fn consume_loop(self, queue: String, notify: Arc<Notify>) {
        tracing::info!(%queue, "consumer started");
        loop {
            if self.deliver_next(&queue).await.is_none() {
                notify.notified().await;
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Topology::checkout())
    }
}

#[async_trait]
impl EventChannel for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        let body = envelope.to_bytes()?;
        let now = Utc::now();

        let notifies: Vec<Arc<Notify>> = {
            let mut state = self.state.lock().await;
            if !state.topology.has_topic(topic) {
                return Err(ChannelError::UnknownTopic(topic.to_string()));
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(ChannelError::Broker("publish rejected".to_string()));
            }

            let mut notifies = Vec::new();
            for queue in state.queues.values_mut() {
                let Some(spec) = &queue.spec else { continue };
                let bound = spec
                    .bindings
                    .iter()
                    .any(|b| b.topic == topic && matches(&b.pattern, routing_key));
                if bound {
                    queue.messages.push_back(QueuedMessage {
                        topic: topic.to_string(),
                        routing_key: routing_key.to_string(),
                        body: body.clone(),
                        enqueued_at: now,
                        death_reason: None,
                    });
                    notifies.push(queue.notify.clone());
                }
            }

            if notifies.is_empty() {
                tracing::debug!(%topic, %routing_key, "no queue bound, message dropped");
            }

            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
            });
            notifies
        };

        for notify in notifies {
            notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut state = self.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .filter(|q| q.spec.is_some())
            .ok_or_else(|| ChannelError::UnknownQueue(queue.to_string()))?;
        if q.handler.is_some() {
            return Err(ChannelError::AlreadySubscribed(queue.to_string()));
        }
        q.handler = Some(handler);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut handles = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if queue.handler.is_none() || queue.consuming {
                continue;
            }
            queue.consuming = true;
            let broker = self.clone();
            let notify = queue.notify.clone();
            let name = name.clone();
            handles.push(tokio::spawn(broker.consume_loop(name, notify)));
        }
        state.consumers.extend(handles);
        Ok(())
    }
}
