//! Settlement of handler outcomes.
//!
//! Whether a handler finished on the spot or started deferred work, exactly
//! one settlement is produced per invocation: a success value or a failure.
//! Callers without a reply path route failures through an [`ErrorHook`].

use std::sync::Arc;

use serde_json::Value;

use crate::error_format::HandlerFailure;
use crate::handler::Outcome;

/// Observer for failures with no reply path. When absent, the failure is
/// logged in the dispatch task instead.
pub type ErrorHook = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// The single settlement of a handler invocation.
#[derive(Debug)]
pub enum Settled {
    Success(Value),
    Failed(HandlerFailure),
}

/// Drive an outcome to its settlement.
pub async fn settle(outcome: Outcome) -> Settled {
    let result = match outcome {
        Outcome::Ready(result) => result,
        Outcome::Deferred(fut) => fut.await,
    };
    match result {
        Ok(value) => Settled::Success(value),
        Err(failure) => Settled::Failed(failure),
    }
}
