//! Cancellation of suspension points.

use std::future::Future;

use a3s_rootfs_core::error::{Result, RootfsError};
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `token` fires first.
///
/// `what` names the interrupted operation in the returned
/// [`RootfsError::Cancelled`].
pub async fn cancellable<T, F>(token: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!(operation = %what, "Cancelled");
            Err(RootfsError::Cancelled(what.to_string()))
        }
        result = fut => result,
    }
}
