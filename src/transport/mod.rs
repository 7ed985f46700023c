//! Broker transport seam.
//!
//! The core consumes the broker through this interface only: declare/bind a
//! queue, consume it as a stream of deliveries, publish with headers, and
//! acknowledge or reject individual deliveries.
//!
//! Implementations:
//! - `AmqpTransport`: RabbitMQ via lapin (feature `amqp`, default)
//! - `MemoryTransport`: in-process topic exchange for tests/embedded use

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tracing::info;

use crate::config::{BusConfig, TransportType};
use crate::error::Result;
use crate::message::Headers;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpTransport};
pub use memory::MemoryTransport;

/// Acknowledgment handle for a single delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A raw message pulled from a queue.
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        headers: Headers,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            headers,
            acker,
        }
    }

    /// Acknowledge the delivery (removes it from the queue).
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the delivery, optionally requeueing it.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Infinite stream of deliveries from one queue. Not restartable once closed.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Interface the core expects from the broker layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare a named queue and bind it to the given patterns. Idempotent.
    ///
    /// `exclusive` marks short-lived, single-consumer queues (reply queues);
    /// the broker may auto-delete them when their consumer goes away.
    async fn declare_queue(&self, queue: &str, patterns: &[&str], exclusive: bool) -> Result<()>;

    /// Bind an existing queue to an additional pattern. Idempotent.
    async fn bind_queue(&self, queue: &str, pattern: &str) -> Result<()>;

    /// Start consuming a queue. Each queue can be consumed once.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Publish a raw message. Resolves once the transport acknowledges it.
    async fn publish(&self, routing_key: &str, payload: &[u8], headers: Headers) -> Result<()>;
}

/// Initialize a transport from configuration.
///
/// AMQP requires the `amqp` feature (included in default).
pub async fn init_transport(config: &BusConfig) -> Result<Arc<dyn Transport>> {
    match config.transport_type {
        TransportType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = AmqpTransport::connect(AmqpConfig {
                    url: config.amqp.url.clone(),
                    exchange: config.amqp.exchange.clone(),
                })
                .await?;
                info!(transport_type = "amqp", "Transport initialized");
                Ok(Arc::new(transport))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(crate::error::BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        TransportType::Memory => {
            info!(transport_type = "memory", "Transport initialized");
            Ok(Arc::new(MemoryTransport::new()))
        }
    }
}
