//! Background tasks

use crate::abuse::RateLimiter;
use crate::state::AppState;
use crate::store::MemoryStore;
use crate::types::FinishReason;
use std::sync::Arc;
use std::time::Duration;

/// Spawn the scheduled expiration sweep
pub fn spawn_cleanup_scheduler(state: Arc<AppState>) {
    let period = state.config.cleanup_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;

            let report = state.sweep_expired_rooms(FinishReason::Expired).await;
            if report.failed_batches > 0 {
                tracing::warn!(
                    failed_batches = report.failed_batches,
                    "Scheduled cleanup left work for the next run"
                );
            }
        }
    });
}

/// Spawn a task that periodically writes the store snapshot to disk
pub fn spawn_snapshot_writer(store: Arc<MemoryStore>, period: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = store.persist().await {
                tracing::error!(error = %e, "Failed to write store snapshot");
            }
        }
    });
}

/// Spawn a task that forgets stale rate limit windows
pub fn spawn_rate_limit_janitor(limiter: RateLimiter) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(limiter.window() * 2).await;
            limiter.cleanup().await;
        }
    });
}
