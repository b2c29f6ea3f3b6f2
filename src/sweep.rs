//! Periodic cleanup of stale payment records.
//!
//! Deletions are best-effort: a skipped or failed sweep only delays cleanup,
//! it never affects correctness, since verification enforces the TTL on its
//! own. The stats endpoint additionally sweeps opportunistically.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::store::PaymentStore;

/// Runs the expiry sweeper until `cancellation` fires.
///
/// Every `interval`, records older than `max_age` are deleted from the
/// store. Intended to be spawned as a background task.
pub async fn run_sweeper(
    store: Arc<PaymentStore>,
    interval: Duration,
    max_age: Duration,
    cancellation: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so startup stays quiet.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::debug!("Expiry sweeper stopping");
                return;
            }
            _ = ticker.tick() => {
                match store.delete_older_than(max_age).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Swept expired payment records"),
                    Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
                }
            }
        }
    }
}
