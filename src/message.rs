//! Message envelope and delivery headers.
//!
//! Content travels as JSON; correlation metadata rides as transport
//! properties so the broker can route replies without parsing payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation metadata attached to a message.
///
/// `correlation_id` and `reply_to` map onto the broker's native message
/// properties; `sync` and `error` travel as header flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Token linking a request to its reply for RPC-style calls.
    pub correlation_id: Option<String>,
    /// Routing key the reply should be published to.
    pub reply_to: Option<String>,
    /// True when the sender is waiting on a reply.
    pub sync: bool,
    /// True on a reply whose content is a formatted error payload.
    pub error: bool,
}

impl Headers {
    /// Headers for a synchronous (RPC) request.
    pub fn rpc(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            sync: true,
            error: false,
        }
    }

    /// Headers for a reply carrying the original correlation id.
    pub fn reply(correlation_id: Option<String>, error: bool) -> Self {
        Self {
            correlation_id,
            reply_to: None,
            sync: false,
            error,
        }
    }
}

/// A message as seen by handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Concrete routing key the message was delivered under.
    pub routing_key: String,
    /// Application payload.
    pub content: Value,
    /// Correlation metadata.
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    /// Create a message with default headers.
    pub fn new(routing_key: impl Into<String>, content: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            content,
            headers: Headers::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_headers() {
        let headers = Headers::rpc("cid-1", "svc.reply.abc");
        assert_eq!(headers.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(headers.reply_to.as_deref(), Some("svc.reply.abc"));
        assert!(headers.sync);
        assert!(!headers.error);
    }

    #[test]
    fn test_reply_headers_preserve_correlation_id() {
        let headers = Headers::reply(Some("cid-1".to_string()), true);
        assert_eq!(headers.correlation_id.as_deref(), Some("cid-1"));
        assert!(headers.reply_to.is_none());
        assert!(!headers.sync);
        assert!(headers.error);
    }

    #[test]
    fn test_message_defaults_to_plain_headers() {
        let msg = Message::new("A.B.C", json!({"hello": "world"}));
        assert_eq!(msg.routing_key, "A.B.C");
        assert!(!msg.headers.sync);
        assert!(msg.headers.correlation_id.is_none());
    }
}
