//! RabbitMQ channel.
//!
//! Declares the [`Topology`] as durable topic exchanges, one durable queue per
//! domain with a paired dead-letter exchange and queue, and a per-queue
//! message TTL. Publishes use publisher confirms so `publish` only returns
//! once the broker has accepted the message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

use crate::channel::{EventChannel, MessageHandler};
use crate::envelope::EventEnvelope;
use crate::error::{ChannelError, Result};
use crate::topology::{QueueSpec, Topology};

fn broker_err(context: &str) -> impl FnOnce(lapin::Error) -> ChannelError + '_ {
    move |e| ChannelError::Broker(format!("{context}: {e}"))
}

/// [`EventChannel`] backed by a RabbitMQ connection.
pub struct AmqpChannel {
    connection: Connection,
    publisher: Channel,
    topology: Topology,
    publish_timeout: Duration,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl AmqpChannel {
    /// Connects to `url` and declares `topology`.
    pub async fn connect(url: &str, topology: Topology, publish_timeout: Duration) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(broker_err("connect"))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(broker_err("create channel"))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_err("enable publisher confirms"))?;

        declare_topology(&publisher, &topology).await?;
        tracing::info!(
            topics = topology.topics.len(),
            queues = topology.queues.len(),
            "connected to AMQP broker"
        );

        Ok(Self {
            connection,
            publisher,
            topology,
            publish_timeout,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    async fn consume(channel: Channel, queue: String, handler: Arc<dyn MessageHandler>) {
        let mut consumer = match channel
            .basic_consume(
                &queue,
                &format!("{queue}-consumer"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(%queue, error = %e, "failed to start consumer");
                return;
            }
        };
        tracing::info!(%queue, "consumer started");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(%queue, error = %e, "consumer delivery error");
                    break;
                }
            };

            match handler.handle(&delivery.data).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::error!(%queue, error = %e, "failed to ack message");
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        %queue,
                        routing_key = %delivery.routing_key,
                        error = %err,
                        "message dead-lettered"
                    );
                    metrics::counter!("events_dead_lettered_total", "queue" => queue.clone())
                        .increment(1);
                    let options = BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    };
                    if let Err(e) = delivery.nack(options).await {
                        tracing::error!(%queue, error = %e, "failed to nack message");
                    }
                }
            }
        }
        tracing::warn!(%queue, "consumer stream ended");
    }
}

async fn declare_topology(channel: &Channel, topology: &Topology) -> Result<()> {
    for topic in &topology.topics {
        for name in [&topic.name, &topic.dead_letter_topic] {
            channel
                .exchange_declare(
                    name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err("declare exchange"))?;
        }
    }

    for queue in &topology.queues {
        declare_queue(channel, queue).await?;
    }
    Ok(())
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

async fn declare_queue(channel: &Channel, queue: &QueueSpec) -> Result<()> {
    let mut args = FieldTable::default();
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongUInt(queue.message_ttl.as_millis().min(u32::MAX as u128) as u32),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(queue.dead_letter_topic.as_str().into()),
    );

    channel
        .queue_declare(&queue.name, durable_queue(), args)
        .await
        .map_err(broker_err("declare queue"))?;
    for binding in &queue.bindings {
        channel
            .queue_bind(
                &queue.name,
                &binding.topic,
                &binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err("bind queue"))?;
    }

    channel
        .queue_declare(&queue.dead_letter_queue, durable_queue(), FieldTable::default())
        .await
        .map_err(broker_err("declare dead-letter queue"))?;
    channel
        .queue_bind(
            &queue.dead_letter_queue,
            &queue.dead_letter_topic,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(broker_err("bind dead-letter queue"))?;

    tracing::debug!(queue = %queue.name, bindings = queue.bindings.len(), "declared queue");
    Ok(())
}

#[async_trait]
impl EventChannel for AmqpChannel {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        if !self.topology.has_topic(topic) {
            return Err(ChannelError::UnknownTopic(topic.to_string()));
        }
        let body = envelope.to_bytes()?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(envelope.event_id.to_string().into());

        let confirm = async {
            let pending = self
                .publisher
                .basic_publish(
                    topic,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(broker_err("publish"))?;
            pending.await.map_err(broker_err("publish confirm"))
        };

        let confirmation = tokio::time::timeout(self.publish_timeout, confirm)
            .await
            .map_err(|_| ChannelError::PublishTimeout(self.publish_timeout))??;

        if confirmation.is_nack() {
            return Err(ChannelError::Broker(format!(
                "broker rejected {routing_key} on {topic}"
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.topology.queue(queue).is_none() {
            return Err(ChannelError::UnknownQueue(queue.to_string()));
        }
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(queue) {
            return Err(ChannelError::AlreadySubscribed(queue.to_string()));
        }
        handlers.insert(queue.to_string(), handler);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let handlers = self.handlers.lock().await;
        for (queue, handler) in handlers.iter() {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(broker_err("create consumer channel"))?;
            channel
                .basic_qos(1, BasicQosOptions::default())
                .await
                .map_err(broker_err("set prefetch"))?;
            tokio::spawn(Self::consume(channel, queue.clone(), handler.clone()));
        }
        Ok(())
    }
}
