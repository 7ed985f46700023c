//! Per-service broadcast state.
//!
//! Each service owns one broadcast queue bound to the union of its
//! subscribed patterns. All local subscription handlers share one group on
//! that queue, so the service consumes each matching broadcast exactly once
//! regardless of how many handlers it registered or how many patterns
//! matched.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::dispatch::{spawn_dispatch_loop, DispatchContext};
use crate::error::{BusError, Result};
use crate::group::HandlerGroup;
use crate::handler::Handler;
use crate::transport::Transport;

pub(crate) struct BroadcastState {
    queue: String,
    group: Arc<HandlerGroup>,
    bound: Mutex<HashSet<String>>,
    consumer: OnceCell<()>,
}

impl BroadcastState {
    pub fn new(service: &str) -> Self {
        Self {
            queue: format!("{}.subscriptions", service),
            group: Arc::new(HandlerGroup::new()),
            bound: Mutex::new(HashSet::new()),
            consumer: OnceCell::new(),
        }
    }

    /// Bind the service's broadcast queue to `pattern` (idempotent) and add
    /// the handler to the shared group. The queue and its consumer are
    /// provisioned on the first subscription.
    pub async fn subscribe(
        &self,
        transport: Arc<dyn Transport>,
        ctx: DispatchContext,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        self.consumer
            .get_or_try_init(|| async {
                transport.declare_queue(&self.queue, &[], false).await?;
                let stream = transport.consume(&self.queue).await?;
                spawn_dispatch_loop(ctx.clone(), Arc::clone(&self.group), stream);
                info!(
                    service = %ctx.service,
                    queue = %self.queue,
                    "Broadcast consumer started"
                );
                Ok::<(), BusError>(())
            })
            .await
            .map(|_: &()| ())?;

        // The handler must be in the rotation before the pattern can route
        // to the queue, or a publish in between meets an empty group.
        let slots = self.group.add(handler).await;

        {
            let mut bound = self.bound.lock().await;
            if !bound.contains(pattern) {
                transport.bind_queue(&self.queue, pattern).await?;
                bound.insert(pattern.to_string());
            } else {
                debug!(
                    service = %ctx.service,
                    pattern = %pattern,
                    "Pattern already bound"
                );
            }
        }
        info!(
            service = %ctx.service,
            pattern = %pattern,
            handlers = slots,
            "Subscribed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_format::default_error_formatter;
    use crate::handler::sync_handler;
    use crate::message::Headers;
    use crate::routing::DeliveryMode;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context(transport: Arc<dyn Transport>) -> DispatchContext {
        DispatchContext {
            service: "svc".to_string(),
            mode: DeliveryMode::Broadcast,
            transport,
            error_formatter: default_error_formatter(),
            on_handler_error: None,
        }
    }

    #[tokio::test]
    async fn test_publish_right_after_subscribe_is_delivered() {
        let transport = Arc::new(MemoryTransport::new());
        let state = BroadcastState::new("svc");

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        state
            .subscribe(
                transport.clone(),
                context(transport.clone()),
                "Z.Y.*",
                sync_handler(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }),
            )
            .await
            .unwrap();

        // No pause between subscribe and publish: once subscribe returns the
        // handler is already in the rotation, so nothing can be dropped.
        transport
            .publish("Z.Y.X", b"{}", Headers::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_pattern_binds_once() {
        let transport = Arc::new(MemoryTransport::new());
        let state = BroadcastState::new("svc");

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let seen = count.clone();
            state
                .subscribe(
                    transport.clone(),
                    context(transport.clone()),
                    "A.B",
                    sync_handler(move |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }),
                )
                .await
                .unwrap();
        }
        assert_eq!(state.bound.lock().await.len(), 1);
        assert_eq!(state.group.len().await, 2);

        transport
            .publish("A.B", b"{}", Headers::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
