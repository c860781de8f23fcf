//! Admission-controlled job queue.
//!
//! Core components:
//! - `entry`: wire form of queue entries
//! - `poll`: priority-tiered dequeue
//! - `intake`: loop keeping the queue as full as permitted
//! - `reporting`: loop publishing progress snapshots with expiring keys
//! - `runner`: per-chain execution and the completion callback
//!
//! Lock order: `loops` (serializes start/stop) may be held while taking
//! `entries` or `times`; `entries` is never held across an `.await` on a store
//! or a chain.

pub mod entry;
pub mod intake;
pub mod poll;
pub mod reporting;
mod runner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainFactory, ChainProgress, ChainRequest, ChainStatus, TaskChain};
use crate::config::QueueConfig;
use crate::error::{AdmissionError, QueueError};
use crate::store::{QueueStore, ResultStore, StatusStore};

/// How often `stop()` re-checks chain statuses while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a cancelled reporting loop may take to finish its cycle.
const REPORTING_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of the job queue as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Constructed; loops not started.
    Initialized,
    /// Intake and reporting loops active.
    Running,
    /// Intake halted; admitted chains allowed to finish.
    Stopping,
    /// Intake halted; admitted chains asked to terminate.
    Terminating,
    /// Drain finished, cleanly or by timeout.
    Stopped,
    /// A start failed; needs operator attention.
    Error,
    /// Final state; the reporting loop exits when it sees it.
    Complete,
}

impl QueueStatus {
    pub fn can_transition_to(&self, target: QueueStatus) -> bool {
        use QueueStatus::*;

        matches!(
            (self, target),
            (Initialized, Running) | (Stopped, Running) |
            (Initialized, Error) | (Stopped, Error) |
            (Running, Stopping) | (Running, Terminating) | (Running, Error) |
            (Stopping, Stopped) | (Terminating, Stopped) |
            (Stopped, Complete)
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Result of `start()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub result: bool,
    /// Queue status after the call.
    pub status: QueueStatus,
    pub message: String,
}

/// How a `stop()` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Every admitted chain settled before the deadline.
    Drained,
    /// The deadline passed with chains still active.
    TimedOut,
    /// The queue was not running.
    Rejected,
}

/// Result of `stop()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub result: bool,
    pub outcome: StopOutcome,
    pub status: QueueStatus,
    pub message: String,
    /// Chains still active when the call returned.
    pub active_chains: usize,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedStatus {
    /// Admitted chains per chain status; every status is present.
    pub chain_status: BTreeMap<ChainStatus, usize>,
    /// Seconds since start, up to the stop time once stopped.
    pub duration: f64,
    pub capacity: usize,
    pub start_time: DateTime<Utc>,
    pub status: QueueStatus,
    pub stop_time: Option<DateTime<Utc>>,
    pub total_in_flight: usize,
}

/// A chain accepted into the queue.
#[derive(Clone)]
pub struct Admission {
    pub id: String,
    pub chain: Arc<dyn TaskChain>,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("id", &self.id)
            .field("chain", &self.chain.name())
            .finish()
    }
}

/// Collaborators the queue talks to.
#[derive(Clone)]
pub struct JobQueueDeps {
    pub factory: Arc<dyn ChainFactory>,
    pub queue_store: Arc<dyn QueueStore>,
    pub status_store: Arc<dyn StatusStore>,
    pub result_store: Arc<dyn ResultStore>,
}

struct AdmittedChain {
    chain: Arc<dyn TaskChain>,
    template: String,
}

#[derive(Debug, Clone, Copy)]
struct QueueTimes {
    start: DateTime<Utc>,
    stop: Option<DateTime<Utc>>,
}

/// A background loop with its own stop signal.
struct BackgroundLoop {
    name: &'static str,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl BackgroundLoop {
    /// Signal the loop and wait for it to finish its current iteration.
    async fn join(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Background loop ended abnormally");
        }
    }

    /// Signal the loop and wait up to `grace` for it to observe the signal.
    /// Returns false if the loop had to be aborted.
    async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "Background loop ended abnormally");
                true
            }
            Err(_) => {
                warn!(task = self.name, "Background loop did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }
}

struct LoopHandles {
    intake: BackgroundLoop,
    reporting: BackgroundLoop,
}

/// Admits chains up to capacity, tracks them while they run, and reports
/// their progress.
pub struct JobQueue {
    config: QueueConfig,
    deps: JobQueueDeps,
    /// In-flight chains by identifier.
    entries: RwLock<HashMap<String, AdmittedChain>>,
    status: watch::Sender<QueueStatus>,
    times: RwLock<QueueTimes>,
    loops: Mutex<Option<LoopHandles>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, deps: JobQueueDeps) -> Arc<Self> {
        let (status, _rx) = watch::channel(QueueStatus::Initialized);
        Arc::new(Self {
            config,
            deps,
            entries: RwLock::new(HashMap::new()),
            status,
            times: RwLock::new(QueueTimes {
                start: Utc::now(),
                stop: None,
            }),
            loops: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: QueueStatus) {
        let previous = self.status.send_replace(status);
        debug!(from = %previous, to = %status, "JobQueue status changed");
    }

    pub(crate) fn queue_store(&self) -> &dyn QueueStore {
        self.deps.queue_store.as_ref()
    }

    /// Start the intake and reporting loops.
    pub async fn start(self: &Arc<Self>) -> ControlResponse {
        let mut loops = self.loops.lock().await;
        let current = self.status();

        if !current.can_transition_to(QueueStatus::Running) {
            return ControlResponse {
                result: false,
                status: current,
                message: format!("JobQueue cannot start while {current}."),
            };
        }

        info!("Starting the JobQueue.");
        {
            let mut times = self.times.write().await;
            times.start = Utc::now();
            times.stop = None;
        }
        self.set_status(QueueStatus::Running);

        match self.launch_loops() {
            Ok(handles) => {
                *loops = Some(handles);
                ControlResponse {
                    result: true,
                    status: QueueStatus::Running,
                    message: "JobQueue started successfully.".to_string(),
                }
            }
            Err(e) => {
                let message = format!("Error while starting the JobQueue: {e}");
                error!("{}", message);
                self.set_status(QueueStatus::Error);
                ControlResponse {
                    result: false,
                    status: QueueStatus::Error,
                    message,
                }
            }
        }
    }

    fn launch_loops(self: &Arc<Self>) -> Result<LoopHandles, QueueError> {
        self.config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| QueueError::LaunchFailed {
            name: "intake".to_string(),
            reason: e.to_string(),
        })?;

        let intake_cancel = CancellationToken::new();
        let intake = BackgroundLoop {
            name: "intake",
            handle: intake::spawn_intake_loop(Arc::clone(self), intake_cancel.clone()),
            cancel: intake_cancel,
        };

        let reporting_cancel = CancellationToken::new();
        let reporting = BackgroundLoop {
            name: "reporting",
            handle: reporting::spawn_reporting_loop(Arc::clone(self), reporting_cancel.clone()),
            cancel: reporting_cancel,
        };

        Ok(LoopHandles { intake, reporting })
    }

    /// Halt intake and wait up to `timeout` for admitted chains to settle.
    ///
    /// With `finish_running_jobs` false every admitted chain is asked to
    /// terminate first. The stop time is recorded whatever the outcome.
    pub async fn stop(&self, finish_running_jobs: bool, timeout: Duration) -> StopResponse {
        let mut loops = self.loops.lock().await;
        let current = self.status();
        let draining = if finish_running_jobs {
            QueueStatus::Stopping
        } else {
            QueueStatus::Terminating
        };

        if !current.can_transition_to(draining) {
            return StopResponse {
                result: false,
                outcome: StopOutcome::Rejected,
                status: current,
                message: format!("JobQueue cannot stop while {current}."),
                active_chains: self.active_count().await,
            };
        }

        let deadline = Instant::now() + timeout;
        warn!(finish_running_jobs, ?timeout, "Stopping the JobQueue.");
        self.set_status(draining);

        // Intake is never aborted: a popped entry must be admitted or pushed
        // back before the loop exits.
        let handles = loops.take();
        let reporting = match handles {
            Some(LoopHandles { intake, reporting }) => {
                intake.join().await;
                Some(reporting)
            }
            None => None,
        };

        if !finish_running_jobs {
            info!("Ordering task chains to terminate.");
            for (id, chain) in self.admitted_chains().await {
                debug!(chain_id = %id, "Requesting termination");
                chain.terminate();
            }
        }

        let drained = self.wait_for_settled(deadline).await;

        if let Some(reporting) = reporting {
            reporting.shutdown(REPORTING_SHUTDOWN_GRACE).await;
        }

        self.times.write().await.stop = Some(Utc::now());
        self.set_status(QueueStatus::Stopped);

        let active_chains = self.active_count().await;
        if drained {
            info!("All task chains have completed.");
            StopResponse {
                result: true,
                outcome: StopOutcome::Drained,
                status: QueueStatus::Stopped,
                message: "All task chains have completed.".to_string(),
                active_chains,
            }
        } else {
            warn!(active_chains, "Timeout exceeded while waiting for task chains to complete.");
            StopResponse {
                result: false,
                outcome: StopOutcome::TimedOut,
                status: QueueStatus::Stopped,
                message: "Timeout exceeded while waiting for task chains to complete.".to_string(),
                active_chains,
            }
        }
    }

    /// Retire a stopped queue at process shutdown. No transition leaves
    /// `complete`.
    pub async fn complete(&self) -> ControlResponse {
        let _loops = self.loops.lock().await;
        let current = self.status();
        if !current.can_transition_to(QueueStatus::Complete) {
            return ControlResponse {
                result: false,
                status: current,
                message: format!("JobQueue cannot complete while {current}."),
            };
        }

        self.set_status(QueueStatus::Complete);
        info!("JobQueue complete.");
        ControlResponse {
            result: true,
            status: QueueStatus::Complete,
            message: "JobQueue complete.".to_string(),
        }
    }

    /// Poll until no admitted chain is active or `deadline` passes.
    async fn wait_for_settled(&self, deadline: Instant) -> bool {
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn active_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.chain.status().is_active())
            .count()
    }

    pub async fn detailed_status(&self) -> DetailedStatus {
        // Read before the times: `stop()` records the stop time first.
        let status = self.status();
        let mut chain_status: BTreeMap<ChainStatus, usize> =
            ChainStatus::ALL.iter().map(|status| (*status, 0)).collect();

        let total_in_flight = {
            let entries = self.entries.read().await;
            for entry in entries.values() {
                *chain_status.entry(entry.chain.status()).or_default() += 1;
            }
            entries.len()
        };

        let times = *self.times.read().await;
        let end = times.stop.unwrap_or_else(Utc::now);
        let duration = (end - times.start).num_milliseconds().max(0) as f64 / 1000.0;

        DetailedStatus {
            chain_status,
            duration,
            capacity: self.config.max_chains,
            start_time: times.start,
            status,
            stop_time: times.stop,
            total_in_flight,
        }
    }

    /// Detailed progress of an admitted chain.
    pub async fn chain_status(&self, id: &str) -> Result<ChainProgress, QueueError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.chain.detailed_progress())
            .ok_or_else(|| QueueError::ChainNotFound { id: id.to_string() })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.entries.read().await.len() >= self.config.max_chains
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Identifiers of admitted chains, sorted.
    pub async fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of admitted chains, taken so callers can await without
    /// holding the table lock.
    pub(crate) async fn admitted_chains(&self) -> Vec<(String, Arc<dyn TaskChain>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.chain)))
            .collect()
    }

    /// Build a chain from its template, admit it and start it.
    ///
    /// Rejects identifiers already admitted but does not check capacity.
    pub async fn admit_from_template(
        self: &Arc<Self>,
        request: ChainRequest,
    ) -> Result<Admission, AdmissionError> {
        self.admit(request, false).await
    }

    /// Like [`Self::admit_from_template`], but the capacity check and the
    /// insert happen under one lock so concurrent admissions cannot exceed
    /// `max_chains`.
    pub async fn admit_within_capacity(
        self: &Arc<Self>,
        request: ChainRequest,
    ) -> Result<Admission, AdmissionError> {
        self.admit(request, true).await
    }

    /// Admit a serialized chain request outside the intake loop.
    ///
    /// Skips the capacity check and priority ordering, but only while the
    /// queue is running.
    pub async fn inject(self: &Arc<Self>, payload: &str) -> Result<Admission, AdmissionError> {
        let status = self.status();
        if status != QueueStatus::Running {
            return Err(AdmissionError::NotAccepting {
                status: status.to_string(),
            });
        }
        let request = entry::parse_request(payload)?;
        let admission = self.admit_from_template(request).await?;
        info!(chain_id = %admission.id, "Chain injected");
        Ok(admission)
    }

    async fn admit(
        self: &Arc<Self>,
        request: ChainRequest,
        enforce_capacity: bool,
    ) -> Result<Admission, AdmissionError> {
        // Cheap pre-checks before paying for a build.
        if let Some(id) = &request.id
            && self.contains(id).await
        {
            return Err(AdmissionError::DuplicateIdentifier { id: id.clone() });
        }
        if enforce_capacity && self.is_full().await {
            return Err(AdmissionError::QueueFull {
                capacity: self.config.max_chains,
            });
        }

        let built = self.deps.factory.build(&request).await?;

        if let Some(kind) = built
            .task_kinds
            .iter()
            .find(|kind| self.config.chain_task_restrictions.contains(kind))
        {
            return Err(AdmissionError::Restricted {
                name: request.template_name.clone(),
                kind: kind.clone(),
            });
        }

        let id = request.id.clone().unwrap_or(built.id);
        let chain = built.chain;

        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&id) {
                return Err(AdmissionError::DuplicateIdentifier { id });
            }
            if enforce_capacity && entries.len() >= self.config.max_chains {
                return Err(AdmissionError::QueueFull {
                    capacity: self.config.max_chains,
                });
            }
            entries.insert(
                id.clone(),
                AdmittedChain {
                    chain: Arc::clone(&chain),
                    template: request.template_name.clone(),
                },
            );
        }

        info!(
            chain_id = %id,
            template = %request.template_name,
            "Chain admitted"
        );

        runner::spawn_chain(Arc::clone(self), id.clone(), Arc::clone(&chain));

        Ok(Admission { id, chain })
    }

    /// Completion callback: remove the chain from the table.
    async fn remove(&self, id: &str) -> Option<String> {
        self.entries
            .write()
            .await
            .remove(id)
            .map(|entry| entry.template)
    }
}
