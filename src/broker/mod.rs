//! # Message Broker
//!
//! Transport between the meter producer and the PV consumer.
//!
//! The abstraction follows AMQP semantics: a connection owns one channel,
//! queues are declared durable and idempotently, messages are published
//! persistent, and every delivery must be acked or nacked by the consumer.
//!
//! - [`InMemoryBroker`]: process-local durable broker, used by default and in tests
//! - [`amqp::AmqpBroker`]: RabbitMQ backend, behind the `amqp` feature

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod factory;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use factory::{build_broker, ConnectionFactory};
pub use memory::InMemoryBroker;

/// Broker-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("acknowledgement failed: {0}")]
    Ack(String),
    #[error("queue not declared: {0}")]
    UnknownQueue(String),
    #[error("connection closed")]
    Closed,
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped delivery tag used to ack/nack
    pub tag: u64,
    pub payload: Vec<u8>,
    /// Set when the broker delivered this message before without a final ack
    pub redelivered: bool,
}

/// Entry point to a broker: opens connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection with a single channel.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// One connection plus its channel. Never shared between workers.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Declare a durable queue. Safe to call repeatedly.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgements.
    async fn subscribe(&mut self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Consumer side of a queue.
///
/// Deliveries that are still unacknowledged when the subscription goes away
/// return to the queue and are redelivered to the next consumer.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `Ok(None)` means the consumer was cancelled
    /// by the broker. Cancel-safe: dropping the future loses no message.
    async fn recv(&mut self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue == false` the message is dropped.
    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
