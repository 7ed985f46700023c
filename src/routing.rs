//! Routing key validation and topic pattern matching.
//!
//! Keys are dot-delimited. In pattern positions `*` matches exactly one
//! segment and `#` matches zero or more segments, per topic exchange rules.

use crate::error::{BusError, Result};

/// Error message for wildcard keys passed to `listen`.
pub const LISTEN_WILDCARD_MESSAGE: &str = "Routing key cannot contain * or # for \"listen\".";

/// Delivery semantics a key is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Competing-consumer command dispatch (`send`/`listen`). Keys are
    /// concrete; wildcards are rejected.
    Command,
    /// Per-service broadcast (`publish`/`subscribe`). Keys may be patterns.
    Broadcast,
}

/// Validate a routing key for the given delivery mode.
///
/// No side effects. `Command` keys must not contain `*` or `#`; any
/// dot-segmented key is accepted for `Broadcast`.
pub fn validate(key: &str, mode: DeliveryMode) -> Result<()> {
    if mode == DeliveryMode::Command && (key.contains('*') || key.contains('#')) {
        return Err(BusError::Validation(LISTEN_WILDCARD_MESSAGE.to_string()));
    }
    Ok(())
}

/// Check whether a binding pattern matches a concrete routing key.
///
/// `*` consumes exactly one segment, `#` consumes zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Try consuming zero segments, then one more at a time.
            matches_segments(rest, key)
                || (!key.is_empty() && matches_segments(pattern, &key[1..]))
        }
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => matches_segments(rest, key_rest),
            None => false,
        },
        Some((&segment, rest)) => match key.split_first() {
            Some((&head, key_rest)) => segment == head && matches_segments(rest, key_rest),
            None => false,
        },
    }
}
