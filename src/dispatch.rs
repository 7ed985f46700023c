//! The shared consume loop: one delivery at a time, one handler per delivery.
//!
//! Each handler group gets its own loop task, so groups make progress
//! independently while deliveries within a group stay strictly sequential.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::completion::{settle, ErrorHook, Settled};
use crate::error_format::ErrorFormatter;
use crate::group::HandlerGroup;
use crate::message::{Headers, Message};
use crate::routing::DeliveryMode;
use crate::transport::{Delivery, DeliveryStream, Transport};

/// Everything a dispatch loop needs besides its stream and group.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub service: String,
    pub mode: DeliveryMode,
    pub transport: Arc<dyn Transport>,
    pub error_formatter: ErrorFormatter,
    pub on_handler_error: Option<ErrorHook>,
}

/// Spawn the pull loop for one handler group.
pub(crate) fn spawn_dispatch_loop(
    ctx: DispatchContext,
    group: Arc<HandlerGroup>,
    mut stream: DeliveryStream,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = stream.next().await {
            process_delivery(&ctx, &group, delivery).await;
        }
        info!(
            service = %ctx.service,
            mode = ?ctx.mode,
            "Dispatch stream ended"
        );
    })
}

/// Decode, select one handler round-robin, settle, reply if asked to.
async fn process_delivery(ctx: &DispatchContext, group: &Arc<HandlerGroup>, delivery: Delivery) {
    let content: Value = match serde_json::from_slice(&delivery.payload) {
        Ok(content) => content,
        Err(e) => {
            error!(
                service = %ctx.service,
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to decode message content"
            );
            // Don't requeue malformed messages.
            if let Err(e) = delivery.nack(false).await {
                error!(error = %e, "Failed to reject message");
            }
            return;
        }
    };

    let message = Message {
        routing_key: delivery.routing_key.clone(),
        content,
        headers: delivery.headers.clone(),
    };

    let Some(handler) = group.next().await else {
        warn!(
            service = %ctx.service,
            routing_key = %delivery.routing_key,
            "Delivery with no registered handlers, requeueing"
        );
        if let Err(e) = delivery.nack(true).await {
            error!(error = %e, "Failed to requeue message");
        }
        return;
    };

    let settled = settle(handler.call(message)).await;

    if delivery.headers.sync {
        match delivery.headers.reply_to.as_deref() {
            Some(reply_to) => {
                publish_reply(ctx, reply_to, delivery.headers.correlation_id.clone(), settled)
                    .await;
            }
            None => warn!(
                service = %ctx.service,
                routing_key = %delivery.routing_key,
                "Sync message without reply-to, dropping result"
            ),
        }
    } else if let Settled::Failed(failure) = &settled {
        // No reply path: surface through the hook, or log and carry on.
        match &ctx.on_handler_error {
            Some(hook) => hook(failure),
            None => error!(
                service = %ctx.service,
                routing_key = %delivery.routing_key,
                error = %failure,
                "Handler failed"
            ),
        }
    }

    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to ack message");
    }
}

/// Publish a handler's settlement back to the caller's reply key.
async fn publish_reply(
    ctx: &DispatchContext,
    reply_to: &str,
    correlation_id: Option<String>,
    settled: Settled,
) {
    let (content, is_error) = match settled {
        Settled::Success(value) => (value, false),
        Settled::Failed(failure) => ((ctx.error_formatter)(&failure), true),
    };

    let payload = match serde_json::to_vec(&content) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Failed to encode reply content");
            return;
        }
    };

    let headers = Headers::reply(correlation_id, is_error);
    if let Err(e) = ctx.transport.publish(reply_to, &payload, headers).await {
        error!(
            service = %ctx.service,
            reply_to = %reply_to,
            error = %e,
            "Failed to publish reply"
        );
    } else {
        debug!(
            service = %ctx.service,
            reply_to = %reply_to,
            error_reply = is_error,
            "Published reply"
        );
    }
}
