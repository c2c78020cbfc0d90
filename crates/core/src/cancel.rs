use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Raised when a caller aborts a blocking operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0} cancelled")]
pub struct Cancelled(pub &'static str);

/// Drives `fut` to completion unless `cancel` fires first.
///
/// Cancellation wins ties, so an already-cancelled token never starts work.
pub async fn with_cancel<F>(
    cancel: &CancellationToken,
    op: &'static str,
    fut: F,
) -> Result<F::Output, Cancelled>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled(op)),
        out = fut => Ok(out),
    }
}

/// Sleeps for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    op: &'static str,
    duration: Duration,
) -> Result<(), Cancelled> {
    with_cancel(cancel, op, tokio::time::sleep(duration)).await
}
