use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flare_core::SignalStore;

use crate::queue::{Job, JobQueue};

/// Run the scheduler until cancelled: one store query per tick, one job per
/// active signal. Evaluation never happens here.
#[tracing::instrument(name = "scheduler", skip_all)]
pub async fn run_scheduler(
    store: Arc<dyn SignalStore>,
    queue: Arc<JobQueue>,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                tick_once(store.as_ref(), &queue).await;
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

/// One scheduler tick: enqueue an evaluation job for every active signal.
/// Jobs for signals still queued or in flight are absorbed by the queue's
/// dedup, so a backed-up pipeline never piles up work per signal.
pub(crate) async fn tick_once(store: &dyn SignalStore, queue: &JobQueue) {
    let ids = match store.active_signal_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            fl_warn!(sched, error = %e, "active signal query failed, skipping tick");
            return;
        }
    };
    let count = ids.len();
    for id in ids {
        queue.push(Job::new(id));
    }
    fl_debug!(sched, signals = count, pending = queue.pending(), "tick complete");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
