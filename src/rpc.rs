//! RPC correlation for synchronous sends.
//!
//! Each service owns one exclusive reply queue, provisioned on the first
//! synchronous send. Pending calls live in a map keyed by correlation id;
//! removal from the map is the commit point, so whichever of reply arrival
//! and timeout removes the entry first settles the call, and the loser finds
//! nothing to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::error_format::RemoteError;
use crate::message::Headers;
use crate::timeout::deadline;
use crate::transport::{DeliveryStream, Transport};

/// A reply settles to the carried value or the formatted remote error.
type ReplySettlement = std::result::Result<Value, RemoteError>;

type PendingMap = HashMap<String, oneshot::Sender<ReplySettlement>>;

/// The map is only held for point lookups and insertions, never across an
/// await, so a blocking mutex keeps it accessible from `Drop`.
type PendingCalls = Arc<Mutex<PendingMap>>;

fn lock_pending(pending: &PendingCalls) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Withdraws a pending call when the issuing future goes away, so a
/// cancelled caller cannot strand an entry in the table. Settlement removal
/// by the reply loop makes this a no-op on the happy path.
struct PendingGuard {
    pending: PendingCalls,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.correlation_id);
    }
}

/// Correlation-id bookkeeping for one service.
pub(crate) struct RpcCorrelator {
    service: String,
    transport: Arc<dyn Transport>,
    /// Reply routing key owned by this service instance.
    reply_key: String,
    pending: PendingCalls,
    consumer: OnceCell<()>,
}

impl RpcCorrelator {
    pub fn new(service: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let service = service.into();
        let reply_key = format!("{}.reply.{}", service, Uuid::new_v4());
        Self {
            service,
            transport,
            reply_key,
            pending: Arc::new(Mutex::new(HashMap::new())),
            consumer: OnceCell::new(),
        }
    }

    /// Issue a synchronous send and wait for its reply or the deadline.
    pub async fn call(&self, routing_key: &str, content: &Value, timeout: Duration) -> Result<Value> {
        self.ensure_reply_consumer().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            correlation_id: correlation_id.clone(),
        };

        let payload = serde_json::to_vec(content)?;
        let headers = Headers::rpc(correlation_id.clone(), self.reply_key.clone());
        self.transport.publish(routing_key, &payload, headers).await?;

        debug!(
            service = %self.service,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            "Issued synchronous send"
        );

        let outcome = deadline(
            async { rx.await.map_err(|_| BusError::ReplyDropped) },
            timeout,
        )
        .await;

        // The guard withdraws the pending entry on every exit path,
        // including timeout, so a late reply finds nothing and is discarded.
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(BusError::Remote(remote)),
            Err(err) => Err(err),
        }
    }

    /// Declare the reply queue and start its consumer, once.
    async fn ensure_reply_consumer(&self) -> Result<()> {
        self.consumer
            .get_or_try_init(|| async {
                self.transport
                    .declare_queue(&self.reply_key, &[self.reply_key.as_str()], true)
                    .await?;
                let stream = self.transport.consume(&self.reply_key).await?;

                let pending = Arc::clone(&self.pending);
                let service = self.service.clone();
                tokio::spawn(reply_loop(stream, pending, service));

                info!(
                    service = %self.service,
                    reply_key = %self.reply_key,
                    "Reply consumer started"
                );
                Ok::<(), BusError>(())
            })
            .await
            .map(|_: &()| ())
    }
}

/// Match replies to pending calls by correlation id.
async fn reply_loop(mut stream: DeliveryStream, pending: PendingCalls, service: String) {
    while let Some(delivery) = stream.next().await {
        let Some(correlation_id) = delivery.headers.correlation_id.clone() else {
            warn!(service = %service, "Reply without correlation id, dropping");
            if let Err(e) = delivery.ack().await {
                error!(error = %e, "Failed to ack reply");
            }
            continue;
        };

        let settlement = match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(content) if delivery.headers.error => Err(RemoteError::new(content)),
            Ok(content) => Ok(content),
            Err(e) => {
                error!(service = %service, error = %e, "Failed to decode reply content");
                if let Err(e) = delivery.nack(false).await {
                    error!(error = %e, "Failed to reject reply");
                }
                continue;
            }
        };

        match lock_pending(&pending).remove(&correlation_id) {
            Some(tx) => {
                // Receiver may have timed out between our remove and send;
                // either way the call settles at most once.
                let _ = tx.send(settlement);
            }
            None => debug!(
                service = %service,
                correlation_id = %correlation_id,
                "Discarding reply with no pending call"
            ),
        }

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to ack reply");
        }
    }
    debug!(service = %service, "Reply stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    /// Echo responder: replies to every delivery on `key` with its content.
    async fn spawn_echo_responder(transport: Arc<MemoryTransport>, key: &str) {
        transport.declare_queue("echo.q", &[key], false).await.unwrap();
        let mut stream = transport.consume("echo.q").await.unwrap();
        let transport_for_replies = transport.clone();
        tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                let reply_to = delivery.headers.reply_to.clone().unwrap();
                let headers = Headers::reply(delivery.headers.correlation_id.clone(), false);
                transport_for_replies
                    .publish(&reply_to, &delivery.payload, headers)
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_call_resolves_with_reply() {
        let transport = Arc::new(MemoryTransport::new());
        spawn_echo_responder(transport.clone(), "A.B").await;

        let correlator = RpcCorrelator::new("svc", transport);
        let value = correlator
            .call("A.B", &json!({"hello": "world"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!({"hello": "world"}));

        // The happy path leaves nothing behind either.
        assert!(correlator.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_times_out_without_responder() {
        let transport = Arc::new(MemoryTransport::new());
        let correlator = RpcCorrelator::new("svc", transport);

        let err = correlator
            .call("no.listener", &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));
        assert_eq!(err.to_string(), "Operation Timed Out.");

        // The pending entry was withdrawn on timeout.
        assert!(correlator.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_rejects_with_remote_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.declare_queue("fail.q", &["A.C"], false).await.unwrap();
        let mut stream = transport.consume("fail.q").await.unwrap();
        let transport_for_replies = transport.clone();
        tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                let reply_to = delivery.headers.reply_to.clone().unwrap();
                let headers = Headers::reply(delivery.headers.correlation_id.clone(), true);
                let payload =
                    serde_json::to_vec(&json!({"name": "Error", "message": "boom", "stack": []}))
                        .unwrap();
                transport_for_replies
                    .publish(&reply_to, &payload, headers)
                    .await
                    .unwrap();
            }
        });

        let correlator = RpcCorrelator::new("svc", transport);
        let err = correlator
            .call("A.C", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            BusError::Remote(remote) => assert_eq!(remote.message(), Some("boom")),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let transport = Arc::new(MemoryTransport::new());
        let correlator = RpcCorrelator::new("svc", transport.clone());

        let err = correlator
            .call("nobody.home", &json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));

        // A reply arriving now carries an unknown correlation id; the loop
        // must swallow it without panicking.
        let headers = Headers::reply(Some("stale-cid".to_string()), false);
        transport
            .publish(&correlator.reply_key, b"{}", headers)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(correlator.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_call_withdraws_pending_entry() {
        let transport = Arc::new(MemoryTransport::new());
        let correlator = Arc::new(RpcCorrelator::new("svc", transport));

        let issuing = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            issuing
                .call("no.listener", &json!({}), Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(correlator.pending.lock().unwrap().len(), 1);

        // Dropping the caller mid-wait must not strand the entry.
        task.abort();
        let _ = task.await;
        assert!(correlator.pending.lock().unwrap().is_empty());
    }
}
