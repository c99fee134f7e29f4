//! Exchange, queue and binding layout shared by every channel implementation.

use std::time::Duration;

/// Outbound topic of the cart domain.
pub const CART_TOPIC: &str = "cart.events";
/// Outbound topic of the order domain.
pub const ORDERS_TOPIC: &str = "orders.events";
/// Outbound topic of the inventory domain.
pub const PRODUCTS_TOPIC: &str = "products.events";

/// Messages older than this are dead-lettered instead of delivered.
pub const MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The three domains taking part in a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Cart,
    Orders,
    Products,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Cart, Domain::Orders, Domain::Products];

    /// The domain's outbound topic.
    pub fn topic(&self) -> &'static str {
        match self {
            Domain::Cart => CART_TOPIC,
            Domain::Orders => ORDERS_TOPIC,
            Domain::Products => PRODUCTS_TOPIC,
        }
    }

    /// The domain's inbound queue.
    pub fn queue(&self) -> &'static str {
        match self {
            Domain::Cart => "cart.queue",
            Domain::Orders => "orders.queue",
            Domain::Products => "products.queue",
        }
    }

    /// Service name recorded in idempotency records.
    pub fn service_name(&self) -> &'static str {
        match self {
            Domain::Cart => "cart-service",
            Domain::Orders => "order-service",
            Domain::Products => "product-service",
        }
    }

    /// Routing-key patterns this domain's queue observes.
    pub fn bindings(&self) -> Vec<Binding> {
        match self {
            Domain::Cart => vec![
                Binding::new(ORDERS_TOPIC, "order.placed"),
                Binding::new(ORDERS_TOPIC, "order.failed"),
                Binding::new(ORDERS_TOPIC, "order.cancelled"),
            ],
            Domain::Orders => vec![
                Binding::new(CART_TOPIC, "cart.checkout.*"),
                Binding::new(ORDERS_TOPIC, "order.*"),
                Binding::new(PRODUCTS_TOPIC, "product.stock.*"),
            ],
            Domain::Products => vec![
                Binding::new(ORDERS_TOPIC, "order.created"),
                Binding::new(ORDERS_TOPIC, "order.confirmed"),
                Binding::new(ORDERS_TOPIC, "order.failed"),
                Binding::new(ORDERS_TOPIC, "order.cancelled"),
            ],
        }
    }
}

/// Dead-letter topic paired with a topic.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlx")
}

/// Dead-letter queue paired with a queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// A queue binding: messages published to `topic` whose routing key matches
/// `pattern` are copied into the bound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub topic: String,
    pub pattern: String,
}

impl Binding {
    pub fn new(topic: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub dead_letter_topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<Binding>,
    /// Where failed or expired messages are routed.
    pub dead_letter_topic: String,
    pub dead_letter_queue: String,
    pub message_ttl: Duration,
}

/// The complete broker layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    pub topics: Vec<TopicSpec>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// One durable topic and one inbound queue per checkout domain.
    pub fn checkout() -> Self {
        let topics = Domain::ALL
            .iter()
            .map(|d| TopicSpec {
                name: d.topic().to_string(),
                dead_letter_topic: dead_letter_topic(d.topic()),
            })
            .collect();

        let queues = Domain::ALL
            .iter()
            .map(|d| QueueSpec {
                name: d.queue().to_string(),
                bindings: d.bindings(),
                dead_letter_topic: dead_letter_topic(d.topic()),
                dead_letter_queue: dead_letter_queue(d.queue()),
                message_ttl: MESSAGE_TTL,
            })
            .collect();

        Self { topics, queues }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.iter().any(|t| t.name == name)
    }
}
