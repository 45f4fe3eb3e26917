//! Broker session contract.
//!
//! The worker talks to the broker only through [`BrokerSession`]. Two
//! implementations are provided:
//! - [`AmqpSession`]: a lapin connection and channel to RabbitMQ
//! - [`MemoryBroker`]: an in-process broker for tests and dry runs

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

pub use amqp::AmqpSession;
pub use memory::{MemoryBroker, MemorySession};

/// Channel-scoped handle identifying one delivery for ack/reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// One message handed to a consumer.
///
/// Deliberately not `Clone`: a delivery is resolved exactly once.
#[derive(Debug)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub tag: DeliveryTag,
    pub redelivered: bool,
    pub routing_key: String,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            tag: DeliveryTag(delivery.delivery_tag),
            redelivered: delivery.redelivered,
            routing_key: delivery.routing_key.to_string(),
            body: delivery.data,
        }
    }
}

/// Deliveries from one subscription. Ends when the subscription is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Connection and channel primitives the worker needs from a broker.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Idempotent. Fails if the exchange exists with a different kind.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Idempotent. Fails if the queue exists with different arguments.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Idempotent. Fails if either endpoint does not exist.
    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError>;

    /// Maximum number of unresolved deliveries handed to this session.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Subscribe to `queue` with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Acknowledge a single delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a single delivery. With `requeue = false` the broker dead-letters
    /// it if the queue names a dead-letter exchange, otherwise discards it.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Release the session. Unresolved deliveries go back to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}
