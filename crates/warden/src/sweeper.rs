//! Periodic task that evicts token records older than the configured max age.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warden_core::RuleEngine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run(engine: Arc<RuleEngine>, max_age: chrono::Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = engine.cleanup_old_tokens(max_age);
                if removed > 0 {
                    tracing::debug!(removed, "swept stale tokens");
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("token sweeper shutting down");
                return;
            }
        }
    }
}
