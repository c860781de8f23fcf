//! Task chains: the executable units the job queue admits.
//!
//! - `state`: chain status vocabulary, progress snapshots, shared bookkeeping
//! - `registry`: template lookup (`ChainFactory`)
//! - `builtin`: templates shipped with the agent

pub mod builtin;
pub mod registry;
pub mod state;

use async_trait::async_trait;

use crate::error::ChainError;

pub use registry::{BuiltChain, ChainFactory, ChainRequest, ChainTemplate, TemplateRegistry};
pub use state::{ChainProgress, ChainState, ChainStatus};

/// An executable task chain.
///
/// The job queue only starts a chain, observes its status and progress, and
/// requests termination. How the chain's tasks run is up to the
/// implementation.
#[async_trait]
pub trait TaskChain: Send + Sync {
    /// Template name the chain was built from.
    fn name(&self) -> &str;

    fn status(&self) -> ChainStatus;

    fn detailed_progress(&self) -> ChainProgress;

    /// Ask the chain to stop. The chain decides how promptly to honor it.
    fn terminate(&self);

    /// Execute the chain to completion. Returning is the completion signal.
    async fn run(&self) -> Result<serde_json::Value, ChainError>;
}
