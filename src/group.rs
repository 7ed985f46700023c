//! Handler groups: ordered handler registries with round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::handler::Handler;

/// An ordered sequence of handlers competing for messages on one queue.
///
/// Selection is a rotating cursor over the sequence, independent of payload.
/// Registering the same handler object twice creates two independent slots.
/// The cursor indexes modulo the group size at selection time, so a handler
/// added mid-stream joins the rotation on the next pick.
pub struct HandlerGroup {
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    cursor: AtomicUsize,
}

impl HandlerGroup {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Append a handler; returns the new group size.
    pub async fn add(&self, handler: Arc<dyn Handler>) -> usize {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
        handlers.len()
    }

    /// Select the next handler round-robin. `None` only for an empty group.
    pub async fn next(&self) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().await;
        if handlers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(Arc::clone(&handlers[index]))
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

impl Default for HandlerGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::sync_handler;
    use crate::message::Message;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize as Counter;

    fn counting_handler(counter: Arc<Counter>) -> Arc<dyn Handler> {
        sync_handler(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        })
    }

    fn message() -> Message {
        Message::new("A.B.C", json!({}))
    }

    #[tokio::test]
    async fn test_empty_group_selects_nothing() {
        let group = HandlerGroup::new();
        assert!(group.next().await.is_none());
    }

    #[tokio::test]
    async fn test_round_robin_alternates() {
        let group = HandlerGroup::new();
        let first = Arc::new(Counter::new(0));
        let second = Arc::new(Counter::new(0));
        group.add(counting_handler(first.clone())).await;
        group.add(counting_handler(second.clone())).await;

        for _ in 0..10 {
            let handler = group.next().await.unwrap();
            let _ = handler.call(message());
        }

        assert_eq!(first.load(Ordering::SeqCst), 5);
        assert_eq!(second.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_duplicate_handler_occupies_two_slots() {
        let group = HandlerGroup::new();
        let counter = Arc::new(Counter::new(0));
        let handler = counting_handler(counter.clone());

        assert_eq!(group.add(handler.clone()).await, 1);
        assert_eq!(group.add(handler).await, 2);
        assert_eq!(group.len().await, 2);

        for _ in 0..4 {
            let handler = group.next().await.unwrap();
            let _ = handler.call(message());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_handler_added_mid_stream_joins_rotation() {
        let group = HandlerGroup::new();
        let first = Arc::new(Counter::new(0));
        group.add(counting_handler(first.clone())).await;

        let _ = group.next().await.unwrap().call(message());

        let second = Arc::new(Counter::new(0));
        group.add(counting_handler(second.clone())).await;

        for _ in 0..4 {
            let handler = group.next().await.unwrap();
            let _ = handler.call(message());
        }

        assert!(first.load(Ordering::SeqCst) >= 2);
        assert!(second.load(Ordering::SeqCst) >= 2);
    }
}
