//! Message broker abstraction
//!
//! Uploads publish one message per record to a named queue, and the record consumer drains the
//! same queue with manual acknowledgement. Two implementations exist:
//!
//! - [`AmqpBroker`]: RabbitMQ over AMQP 0.9.1
//! - [`InMemoryBroker`]: in-process queues, selected with a `memory://` URL
//!
//! A broker handle is created once at startup and shared as `Arc<dyn BrokerChannel>` by every
//! publisher and the consumer.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::BrokerConfig;

pub use amqp::AmqpBroker;
pub use memory::{InMemoryBroker, Settlement};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Live stream of deliveries from one subscription
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("Queue '{0}' already has a consumer")]
    AlreadyConsuming(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a non-durable, non-exclusive queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Send one payload to `queue` without waiting for a delivery confirmation.
    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Subscribe to `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;
}

/// Settles one delivery with the broker it came from
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A received message. Settling consumes it, so each delivery is settled at most once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        payload: Vec<u8>,
        redelivered: bool,
        acker: impl Acker + 'static,
    ) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Open the broker named by `config.url`.
pub async fn connect(config: &BrokerConfig) -> BrokerResult<Arc<dyn BrokerChannel>> {
    if config.url.starts_with(memory::SCHEME) {
        tracing::warn!("Using the in-process broker; messages are lost on restart");
        return Ok(Arc::new(InMemoryBroker::new()));
    }

    Ok(Arc::new(AmqpBroker::connect(config).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_connect_memory_url() {
        let mut config = Config::default().broker;
        config.url = "memory://".to_string();

        let broker = connect(&config).await.unwrap();
        broker.declare_queue("records").await.unwrap();
        broker.publish("records", b"{}").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let mut config = Config::default().broker;
        config.url = "not a url".to_string();

        assert!(matches!(connect(&config).await, Err(BrokerError::InvalidUrl(_))));
    }
}
