//! The handler capability and its closure adapters.
//!
//! Handlers are stored as trait objects in a handler group. A handler may
//! finish immediately or hand back deferred work; the two shapes are
//! normalized by [`crate::completion::settle`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error_format::HandlerFailure;
use crate::message::Message;

/// What a handler invocation produces.
pub type HandlerResult = std::result::Result<Value, HandlerFailure>;

/// Outcome of invoking a handler: settled on the spot, or still in flight.
pub enum Outcome {
    /// The handler completed synchronously.
    Ready(HandlerResult),
    /// The handler started deferred work.
    Deferred(BoxFuture<'static, HandlerResult>),
}

/// Uniform callable capability for message processing.
pub trait Handler: Send + Sync {
    fn call(&self, message: Message) -> Outcome;
}

/// Adapt a synchronous closure into a handler.
pub fn sync_handler<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(SyncFn(f))
}

/// Adapt an async closure into a handler.
pub fn async_handler<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(AsyncFn(f))
}

struct SyncFn<F>(F);

impl<F> Handler for SyncFn<F>
where
    F: Fn(Message) -> HandlerResult + Send + Sync,
{
    fn call(&self, message: Message) -> Outcome {
        Outcome::Ready((self.0)(message))
    }
}

struct AsyncFn<F>(F);

impl<F, Fut> Handler for AsyncFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: Message) -> Outcome {
        Outcome::Deferred(Box::pin((self.0)(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> Message {
        Message::new("A.B.C", json!({"n": 1}))
    }

    #[test]
    fn test_sync_handler_is_ready() {
        let handler = sync_handler(|msg| Ok(msg.content["n"].clone()));
        match handler.call(message()) {
            Outcome::Ready(Ok(value)) => assert_eq!(value, json!(1)),
            _ => panic!("expected a ready success"),
        }
    }

    #[tokio::test]
    async fn test_async_handler_is_deferred() {
        let handler = async_handler(|msg| async move { Ok(msg.content["n"].clone()) });
        match handler.call(message()) {
            Outcome::Deferred(fut) => assert_eq!(fut.await.unwrap(), json!(1)),
            Outcome::Ready(_) => panic!("expected deferred work"),
        }
    }
}
