//! Periodic session expiry and intent reconciliation

use crate::pipeline::IngestPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Run one maintenance pass: evict idle sessions, then reconcile intents
/// older than the configured age.
pub async fn run_once(pipeline: &IngestPipeline) {
    let evicted = pipeline.evict_expired().await;
    if evicted > 0 {
        debug!("Evicted {} idle upload sessions", evicted);
    }

    if !pipeline.store_ready() {
        return;
    }
    match pipeline
        .reconcile_intents(pipeline.settings().reconcile_after)
        .await
    {
        Ok(resolved) if !resolved.is_empty() => {
            debug!("Reconciled {} upload intents", resolved.len())
        }
        Ok(_) => {}
        Err(e) => warn!("Intent reconciliation failed: {}", e),
    }
}

/// Spawn the maintenance loop. The first pass runs after one `period`.
pub fn spawn(pipeline: Arc<IngestPipeline>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_once(&pipeline).await;
        }
    })
}
