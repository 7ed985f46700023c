//! Resolve-or-timeout race primitive.

use std::future::Future;
use std::time::Duration;

use crate::error::{BusError, Result};

/// Race an operation against a deadline.
///
/// Returns the operation's result if it settles within `limit`, otherwise
/// [`BusError::Timeout`]. The timer is dropped as soon as the operation
/// settles, so nothing leaks on the fast path.
pub async fn deadline<T, F>(operation: F, limit: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(settled) => settled,
        Err(_elapsed) => Err(BusError::Timeout),
    }
}
