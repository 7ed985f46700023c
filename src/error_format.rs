//! Handler failure representation and the error formatter pipeline.
//!
//! A failed handler produces a [`HandlerFailure`]. For synchronous calls the
//! owning service's [`ErrorFormatter`] turns it into a wire-safe JSON payload
//! that travels back on the reply path; the caller observes it as a
//! [`RemoteError`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Converts a handler failure into the payload a synchronous caller's
/// promise rejects with. The returned value is transported verbatim.
pub type ErrorFormatter = Arc<dyn Fn(&HandlerFailure) -> Value + Send + Sync>;

/// A failure raised by a handler invocation.
///
/// `stack` is an ordered sequence of frame strings, never multi-line text.
/// `data` is an open extension slot for application detail (for example an
/// error code a custom formatter wants to transport); it is not part of the
/// default wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerFailure {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(skip)]
    pub data: Value,
}

impl HandlerFailure {
    /// Failure named `Error`, with the stack captured at the call site.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// Failure with an explicit name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: capture_stack(),
            data: Value::Null,
        }
    }

    /// Build a failure from any error value, preserving its display message.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(error.to_string())
    }

    /// Attach application detail for custom formatters.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Render the current backtrace as ordered frame strings.
fn capture_stack() -> Vec<String> {
    std::backtrace::Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// The default formatter: `{name, message, stack}`.
pub fn default_error_formatter() -> ErrorFormatter {
    Arc::new(|failure| {
        serde_json::to_value(failure).unwrap_or_else(|_| Value::Null)
    })
}

/// Caller-side view of a formatted remote failure.
///
/// Wraps the payload exactly as the remote formatter produced it. The
/// accessors recover the default formatter's fields when present; a custom
/// formatter's payload is available through [`RemoteError::payload`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    payload: Value,
}

impl RemoteError {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// The transported payload, verbatim.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Error name, when the payload follows the default format.
    pub fn name(&self) -> Option<&str> {
        self.payload.get("name")?.as_str()
    }

    /// Error message, when the payload follows the default format.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message")?.as_str()
    }

    /// Ordered stack frames, when the payload follows the default format.
    pub fn stack(&self) -> Vec<&str> {
        self.payload
            .get("stack")
            .and_then(Value::as_array)
            .map(|frames| frames.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => f.write_str(message),
            None => write!(f, "{}", self.payload),
        }
    }
}

impl std::error::Error for RemoteError {}
