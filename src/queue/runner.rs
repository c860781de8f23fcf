//! Per-chain execution and the completion callback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::JobQueue;
use crate::chain::{ChainProgress, ChainStatus, TaskChain};
use crate::error::ChainError;
use crate::payload;

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// How long a timed-out chain may take to honor its termination request.
const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Final record persisted to the result store.
#[derive(Debug, Serialize)]
struct ChainResult<'a> {
    id: &'a str,
    template: &'a str,
    status: ChainStatus,
    progress: &'a ChainProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    completed_at: DateTime<Utc>,
}

/// Run an admitted chain in its own task, bounded by the chain timeout.
pub(super) fn spawn_chain(
    queue: Arc<JobQueue>,
    id: String,
    chain: Arc<dyn TaskChain>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = execute(&queue, &id, chain.as_ref()).await;
        complete(&queue, &id, chain.as_ref(), outcome).await;
    })
}

async fn execute(
    queue: &JobQueue,
    id: &str,
    chain: &dyn TaskChain,
) -> Result<serde_json::Value, ChainError> {
    let timeout = queue.config.chain_timeout;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // interval() panics on a zero period.
    let period = queue.config.chain_progress_interval.max(MIN_PROGRESS_INTERVAL);
    let mut progress_tick = tokio::time::interval(period);
    // Skip immediate first tick
    progress_tick.tick().await;

    let run = chain.run();
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => return result,
            _ = &mut deadline => break,
            _ = progress_tick.tick() => {
                let progress = chain.detailed_progress();
                debug!(
                    chain_id = %id,
                    status = %progress.status,
                    current = progress.current,
                    total = progress.total,
                    "Chain progress"
                );
            }
        }
    }

    warn!(chain_id = %id, ?timeout, "Chain timed out, requesting termination");
    chain.terminate();
    if tokio::time::timeout(TIMEOUT_GRACE, &mut run).await.is_err() {
        warn!(
            chain_id = %id,
            grace = ?TIMEOUT_GRACE,
            "Chain ignored termination, abandoning it"
        );
    }
    Err(ChainError::TimedOut { timeout })
}

/// Final view of a chain that has returned or been abandoned.
///
/// A chain that never recorded a settled status is reported as `complete` or
/// `error` according to its outcome, never as still active.
fn settled_progress(
    mut progress: ChainProgress,
    outcome: &Result<serde_json::Value, ChainError>,
) -> ChainProgress {
    if progress.status.is_active() {
        progress.status = match outcome {
            Ok(_) => ChainStatus::Complete,
            Err(_) => ChainStatus::Error,
        };
        if progress.end.is_none() {
            progress.end = Some(Utc::now());
        }
    }
    progress
}

/// Publish the final snapshot and result, then drop the chain from the
/// table.
async fn complete(
    queue: &JobQueue,
    id: &str,
    chain: &dyn TaskChain,
    outcome: Result<serde_json::Value, ChainError>,
) {
    let progress = settled_progress(chain.detailed_progress(), &outcome);
    let (result, error) = match &outcome {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e.to_string())),
    };

    match serde_json::to_value(&progress) {
        Ok(snapshot) => {
            if let Err(e) = queue
                .deps
                .status_store
                .write_snapshot(id, &payload::normalize(&snapshot), queue.config.status_ttl())
                .await
            {
                warn!(chain_id = %id, error = %e, "Failed to publish final chain snapshot");
            }
        }
        Err(e) => warn!(chain_id = %id, error = %e, "Failed to serialize chain progress"),
    }

    let record = ChainResult {
        id,
        template: chain.name(),
        status: progress.status,
        progress: &progress,
        result,
        error,
        completed_at: Utc::now(),
    };
    match serde_json::to_value(&record) {
        Ok(value) => {
            if let Err(e) = queue
                .deps
                .result_store
                .write_result(id, &payload::normalize(&value))
                .await
            {
                warn!(chain_id = %id, error = %e, "Failed to persist chain result");
            }
        }
        Err(e) => warn!(chain_id = %id, error = %e, "Failed to serialize chain result"),
    }

    queue.remove(id).await;

    match outcome {
        Ok(_) => info!(chain_id = %id, status = %progress.status, "Chain completed"),
        Err(e) => warn!(chain_id = %id, status = %progress.status, error = %e, "Chain ended with error"),
    }
}
