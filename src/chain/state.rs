//! Chain status vocabulary and progress tracking.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Status of an individual task chain.
///
/// Distinct from [`crate::queue::QueueStatus`], which describes the job
/// queue's own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Built but not yet started.
    Initialized,
    /// Executing.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Error,
    /// Skipped without running.
    Skipped,
    /// Termination was requested and honored.
    Terminating,
}

impl ChainStatus {
    /// Every status value, in display order.
    pub const ALL: [ChainStatus; 6] = [
        Self::Initialized,
        Self::Running,
        Self::Complete,
        Self::Error,
        Self::Skipped,
        Self::Terminating,
    ];

    /// A chain in an active state still holds work and blocks a drain.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initialized | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Terminating => "terminating",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed progress snapshot of a chain.
///
/// Published to the status store by the reporting loop and returned by the
/// chain status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainProgress {
    /// Template the chain was built from.
    pub name: String,
    pub status: ChainStatus,
    /// Total number of tasks in the chain.
    pub total: usize,
    /// Number of tasks finished so far.
    pub current: usize,
    /// `current / total` as a percentage; 100 for an empty chain.
    pub percent: f64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Seconds elapsed between start and end (or now, while running).
    pub duration: f64,
    /// Errors recorded by the chain's tasks.
    pub errors: Vec<String>,
    /// Free-form per-chain details.
    pub meta: serde_json::Value,
}

#[derive(Debug)]
struct Inner {
    status: ChainStatus,
    total: usize,
    current: usize,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    errors: Vec<String>,
    meta: serde_json::Value,
}

/// Shared bookkeeping for chain implementations.
///
/// Tracks status, task counters and timestamps behind a short-lived mutex,
/// and carries the termination signal the chain's tasks watch.
#[derive(Debug)]
pub struct ChainState {
    name: String,
    inner: Mutex<Inner>,
    terminate: CancellationToken,
}

impl ChainState {
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                status: ChainStatus::Initialized,
                total,
                current: 0,
                start: None,
                end: None,
                errors: Vec::new(),
                meta: serde_json::Value::Null,
            }),
            terminate: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ChainStatus {
        self.lock().status
    }

    /// Mark the chain as running and stamp its start time.
    pub fn begin(&self) {
        let mut inner = self.lock();
        inner.status = ChainStatus::Running;
        if inner.start.is_none() {
            inner.start = Some(Utc::now());
        }
    }

    /// Record one finished task.
    pub fn advance(&self) {
        let mut inner = self.lock();
        inner.current = (inner.current + 1).min(inner.total);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.lock().errors.push(error.into());
    }

    pub fn set_meta(&self, meta: serde_json::Value) {
        self.lock().meta = meta;
    }

    /// Move to a settled status and stamp the end time.
    pub fn finish(&self, status: ChainStatus) {
        let mut inner = self.lock();
        inner.status = status;
        inner.end = Some(Utc::now());
    }

    /// Request termination. Tasks observe it through [`Self::terminated`].
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once termination has been requested.
    pub async fn terminated(&self) {
        self.terminate.cancelled().await
    }

    pub fn progress(&self) -> ChainProgress {
        let inner = self.lock();
        let percent = if inner.total == 0 {
            100.0
        } else {
            inner.current as f64 / inner.total as f64 * 100.0
        };
        let duration = inner
            .start
            .map(|start| {
                let end = inner.end.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as f64 / 1000.0
            })
            .unwrap_or(0.0);

        ChainProgress {
            name: self.name.clone(),
            status: inner.status,
            total: inner.total,
            current: inner.current,
            percent,
            start: inner.start,
            end: inner.end,
            duration,
            errors: inner.errors.clone(),
            meta: inner.meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(ChainStatus::Initialized.is_active());
        assert!(ChainStatus::Running.is_active());
        assert!(!ChainStatus::Complete.is_active());
        assert!(!ChainStatus::Error.is_active());
        assert!(!ChainStatus::Skipped.is_active());
        assert!(!ChainStatus::Terminating.is_active());
    }

    #[test]
    fn all_covers_every_status() {
        let names: Vec<&str> = ChainStatus::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            ["initialized", "running", "complete", "error", "skipped", "terminating"]
        );
    }

    #[test]
    fn status_serde_matches_display() {
        for status in ChainStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn progress_tracks_counters() {
        let state = ChainState::new("wait", 4);
        assert_eq!(state.status(), ChainStatus::Initialized);
        assert!(state.progress().start.is_none());

        state.begin();
        state.advance();
        let progress = state.progress();
        assert_eq!(progress.status, ChainStatus::Running);
        assert_eq!(progress.current, 1);
        assert_eq!(progress.percent, 25.0);
        assert!(progress.start.is_some());

        state.finish(ChainStatus::Complete);
        assert!(state.progress().end.is_some());
    }

    #[test]
    fn advance_never_exceeds_total() {
        let state = ChainState::new("wait", 1);
        state.advance();
        state.advance();
        assert_eq!(state.progress().current, 1);
    }

    #[test]
    fn empty_chain_reports_full_percent() {
        let state = ChainState::new("noop", 0);
        assert_eq!(state.progress().percent, 100.0);
    }

    #[tokio::test]
    async fn terminate_wakes_waiters() {
        let state = std::sync::Arc::new(ChainState::new("wait", 1));
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.terminated().await })
        };
        assert!(!state.is_terminate_requested());
        state.terminate();
        waiter.await.unwrap();
        assert!(state.is_terminate_requested());
    }
}
