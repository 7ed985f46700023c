//! AMQP (RabbitMQ) transport implementation.
//!
//! Publishes to a durable topic exchange and consumes from bound queues.
//! Correlation id and reply-to ride as native message properties; the
//! `sync`/`error` flags travel as header booleans.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use tracing::{debug, error, info};

use super::{Acknowledge, Delivery, DeliveryStream, Transport};
use crate::error::{BusError, Result};
use crate::message::Headers;

/// Default exchange name for hopline messages.
const MESSAGES_EXCHANGE: &str = "hopline.messages";

/// Configuration for the AMQP connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange all messages route through.
    pub exchange: String,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: MESSAGES_EXCHANGE.to_string(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }
}

/// AMQP transport backed by a pooled connection.
pub struct AmqpTransport {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpTransport {
    /// Connect, verify the connection, and declare the topic exchange.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            "Connected to AMQP"
        );

        Ok(Self { pool, config })
    }

    /// Get a channel from the pool.
    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    fn properties(headers: &Headers) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        if let Some(ref correlation_id) = headers.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(ref reply_to) = headers.reply_to {
            properties = properties.with_reply_to(reply_to.clone().into());
        }

        let mut table: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
        table.insert("sync".into(), AMQPValue::Boolean(headers.sync));
        table.insert("error".into(), AMQPValue::Boolean(headers.error));
        properties.with_headers(FieldTable::from(table))
    }

    fn headers_of(properties: &BasicProperties) -> Headers {
        let flag = |name: &str| -> bool {
            properties
                .headers()
                .as_ref()
                .and_then(|table| match table.inner().get(name) {
                    Some(AMQPValue::Boolean(value)) => Some(*value),
                    _ => None,
                })
                .unwrap_or(false)
        };

        Headers {
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.to_string()),
            reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
            sync: flag("sync"),
            error: flag("error"),
        }
    }
}

struct AmqpAck(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for AmqpAck {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Consume(format!("Failed to nack: {}", e)))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(&self, queue: &str, patterns: &[&str], exclusive: bool) -> Result<()> {
        let channel = self.channel().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: !exclusive,
                    exclusive,
                    auto_delete: exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to declare queue: {}", e)))?;

        for pattern in patterns {
            channel
                .queue_bind(
                    queue,
                    &self.config.exchange,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Consume(format!("Failed to bind queue: {}", e)))?;
        }

        info!(
            queue = %queue,
            patterns = ?patterns,
            "Declared and bound queue"
        );

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, pattern: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                &self.config.exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to bind queue: {}", e)))?;

        debug!(queue = %queue, pattern = %pattern, "Bound queue to pattern");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self.channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("hopline-{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, "Consumer started");

        let stream = consumer.filter_map(|result| async move {
            match result {
                Ok(delivery) => {
                    let headers = Self::headers_of(&delivery.properties);
                    Some(Delivery::new(
                        delivery.routing_key.to_string(),
                        delivery.data,
                        headers,
                        Box::new(AmqpAck(delivery.acker)) as Box<dyn Acknowledge>,
                    ))
                }
                Err(e) => {
                    error!(error = %e, "Consumer delivery error");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn publish(&self, routing_key: &str, payload: &[u8], headers: Headers) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let properties = Self::properties(&headers);
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel for each attempt (handles reconnection)
            let channel = match self.channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            match channel
                .basic_publish(
                    &self.config.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties.clone(),
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %self.config.exchange,
                            routing_key = %routing_key,
                            "Published message"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test --features amqp amqp_integration -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_and_consume() {
        let transport = AmqpTransport::connect(AmqpConfig::new(amqp_url()))
            .await
            .expect("Failed to connect");

        let queue = format!("test-queue-{}", uuid::Uuid::new_v4());
        transport
            .declare_queue(&queue, &["it.works"], true)
            .await
            .expect("Failed to declare queue");

        let mut stream = transport.consume(&queue).await.expect("Failed to consume");

        let payload = serde_json::to_vec(&json!({"hello": "world"})).unwrap();
        transport
            .publish("it.works", &payload, Headers::default())
            .await
            .expect("Failed to publish");

        let delivery = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Stream ended");

        assert_eq!(delivery.routing_key, "it.works");
        assert_eq!(delivery.payload, payload);
        delivery.ack().await.expect("Failed to ack");
    }
}
