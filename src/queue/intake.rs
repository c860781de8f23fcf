//! Intake loop: keeps the job queue as full as permitted.
//!
//! Polls at a fixed rate whether or not the last poll found work. A full queue
//! skips the poll, so pending entries stay in the remote queue until a slot
//! frees.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{JobQueue, QueueStatus, poll};
use crate::error::AdmissionError;

/// What a single intake iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// At capacity; nothing was polled.
    Full,
    /// No pending entry in any accepted tier.
    Idle,
    /// The popped entry was admitted under this identifier.
    Admitted(String),
    /// The popped entry was pushed back to its list.
    Deferred,
    /// The popped entry could not be admitted and was dropped.
    Rejected(String),
    /// The queue store could not be read.
    StoreUnavailable,
}

pub(super) fn spawn_intake_loop(queue: Arc<JobQueue>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = queue.config().queue_check_interval;
        info!(?interval, "Intake loop started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            if queue.status() != QueueStatus::Running {
                break;
            }

            intake_once(&queue).await;
        }

        info!("Intake loop stopped");
    })
}

/// Run one intake iteration: poll the remote queue and admit what it yields.
pub async fn intake_once(queue: &Arc<JobQueue>) -> IntakeOutcome {
    if queue.is_full().await {
        debug!("Job queue full, deferring intake");
        return IntakeOutcome::Full;
    }

    let config = queue.config();
    let task = match poll::oldest_task(
        queue.queue_store(),
        &config.accepted_priorities,
        config.scan_batch,
    )
    .await
    {
        Ok(Some(task)) => task,
        Ok(None) => return IntakeOutcome::Idle,
        Err(e) => {
            warn!(error = %e, "Failed to poll the remote queue");
            return IntakeOutcome::StoreUnavailable;
        }
    };

    debug!(
        key = %task.key,
        priority = task.priority,
        "Dequeued chain request"
    );

    let request = match task.request() {
        Ok(request) => request,
        Err(e) => {
            warn!(key = %task.key, error = %e, "Dropping malformed queue entry");
            return IntakeOutcome::Rejected(e.to_string());
        }
    };

    // stop() may have landed while we were polling.
    if queue.status() != QueueStatus::Running {
        return defer(queue, &task.key, &task.payload).await;
    }

    match queue.admit_within_capacity(request).await {
        Ok(admission) => IntakeOutcome::Admitted(admission.id),
        Err(AdmissionError::QueueFull { .. }) => defer(queue, &task.key, &task.payload).await,
        Err(e) => {
            warn!(key = %task.key, error = %e, "Queue entry rejected");
            IntakeOutcome::Rejected(e.to_string())
        }
    }
}

async fn defer(queue: &JobQueue, key: &str, payload: &str) -> IntakeOutcome {
    match queue.queue_store().push_head(key, payload).await {
        Ok(()) => {
            debug!(key = %key, "Queue entry deferred");
            IntakeOutcome::Deferred
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to push back deferred queue entry");
            IntakeOutcome::Rejected(e.to_string())
        }
    }
}
