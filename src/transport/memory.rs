//! In-process topic exchange.
//!
//! Routes published messages to every queue whose bindings match the routing
//! key, with full `*`/`#` pattern semantics. One consumer per queue; within a
//! process the consumer competes for messages exactly as a broker queue
//! would. Ideal for tests and embedded use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{Acknowledge, Delivery, DeliveryStream, Transport};
use crate::error::{BusError, Result};
use crate::message::Headers;
use crate::routing::topic_matches;

struct QueueState {
    patterns: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken on first consume; a queue cannot be consumed twice.
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

/// In-memory transport backing.
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct NoopAck;

#[async_trait]
impl Acknowledge for NoopAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(&self, queue: &str, patterns: &[&str], _exclusive: bool) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                patterns: HashSet::new(),
                tx,
                rx: Some(rx),
            }
        });
        state
            .patterns
            .extend(patterns.iter().map(|p| p.to_string()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, pattern: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Consume(format!("Unknown queue '{queue}'")))?;
        state.patterns.insert(pattern.to_string());
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Consume(format!("Unknown queue '{queue}'")))?;
        let rx = state
            .rx
            .take()
            .ok_or_else(|| BusError::Consume(format!("Queue '{queue}' is already consumed")))?;

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, routing_key: &str, payload: &[u8], headers: Headers) -> Result<()> {
        let queues = self.queues.lock().await;
        for (name, state) in queues.iter() {
            let matched = state
                .patterns
                .iter()
                .any(|pattern| topic_matches(pattern, routing_key));
            if !matched {
                continue;
            }

            let delivery = Delivery::new(
                routing_key,
                payload.to_vec(),
                headers.clone(),
                Box::new(NoopAck),
            );
            if state.tx.send(delivery).is_err() {
                // Consumer went away; a real broker would just drop too.
                debug!(queue = %name, routing_key, "Dropping delivery for closed consumer");
            }
        }
        Ok(())
    }
}
