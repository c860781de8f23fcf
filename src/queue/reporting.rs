//! Reporting loop: publishes admitted chains' progress to the status store.
//!
//! Every write refreshes the key's expiration to ten reporting intervals, so
//! snapshots from a crashed agent clear themselves.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{JobQueue, QueueStatus};
use crate::payload;

/// Counts from one reporting cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub written: usize,
    pub failed: usize,
}

pub(super) fn spawn_reporting_loop(
    queue: Arc<JobQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = queue.config().reporting_interval;
        info!(?interval, "Reporting loop started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            report_once(&queue).await;

            if matches!(
                queue.status(),
                QueueStatus::Complete | QueueStatus::Terminating
            ) {
                break;
            }
        }

        info!("Reporting loop stopped");
    })
}

/// Publish one snapshot per admitted chain. A failed write is logged and the
/// rest of the cycle carries on.
pub async fn report_once(queue: &JobQueue) -> ReportSummary {
    let ttl = queue.config().status_ttl();
    let mut summary = ReportSummary::default();

    for (id, chain) in queue.admitted_chains().await {
        let snapshot = match serde_json::to_value(chain.detailed_progress()) {
            Ok(value) => payload::normalize(&value),
            Err(e) => {
                warn!(chain_id = %id, error = %e, "Failed to serialize chain progress");
                summary.failed += 1;
                continue;
            }
        };

        match queue.deps.status_store.write_snapshot(&id, &snapshot, ttl).await {
            Ok(()) => summary.written += 1,
            Err(e) => {
                warn!(chain_id = %id, error = %e, "Failed to report chain progress");
                summary.failed += 1;
            }
        }
    }

    if summary.failed == 0 {
        debug!(chains = summary.written, "Chain progress reported.");
    }
    summary
}
