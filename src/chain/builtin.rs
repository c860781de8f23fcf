//! Built-in chain templates.
//!
//! - `noop`: completes immediately.
//! - `wait`: sleeps in `steps` slices totalling `seconds`, honoring
//!   termination between and during slices.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::registry::{ChainTemplate, TemplateRegistry};
use super::state::{ChainProgress, ChainState, ChainStatus};
use super::TaskChain;
use crate::error::ChainError;

pub fn register_builtins(registry: &TemplateRegistry) {
    registry.register_sync(Arc::new(NoopTemplate));
    registry.register_sync(Arc::new(WaitTemplate));
}

pub struct NoopTemplate;

impl ChainTemplate for NoopTemplate {
    fn name(&self) -> &str {
        "noop"
    }

    fn task_kinds(&self) -> Vec<String> {
        vec!["noop".to_string()]
    }

    fn build(&self, _user_parameters: &serde_json::Value) -> Result<Arc<dyn TaskChain>, ChainError> {
        Ok(Arc::new(NoopChain {
            state: ChainState::new("noop", 0),
        }))
    }
}

struct NoopChain {
    state: ChainState,
}

#[async_trait]
impl TaskChain for NoopChain {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn status(&self) -> ChainStatus {
        self.state.status()
    }

    fn detailed_progress(&self) -> ChainProgress {
        self.state.progress()
    }

    fn terminate(&self) {
        self.state.terminate();
    }

    async fn run(&self) -> Result<serde_json::Value, ChainError> {
        self.state.begin();
        self.state.finish(ChainStatus::Complete);
        Ok(json!({}))
    }
}

pub struct WaitTemplate;

impl WaitTemplate {
    fn parse(params: &serde_json::Value) -> Result<(Duration, usize), ChainError> {
        let seconds = match params.get("seconds") {
            None | Some(serde_json::Value::Null) => 0.0,
            Some(value) => value.as_f64().ok_or_else(|| ChainError::InvalidParameters {
                name: "seconds".to_string(),
                reason: format!("expected a number, got {value}"),
            })?,
        };
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ChainError::InvalidParameters {
                name: "seconds".to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }

        let steps = match params.get("steps") {
            None | Some(serde_json::Value::Null) => 1,
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| ChainError::InvalidParameters {
                    name: "steps".to_string(),
                    reason: format!("expected a positive integer, got {value}"),
                })? as usize,
        };

        Ok((Duration::from_secs_f64(seconds), steps))
    }
}

impl ChainTemplate for WaitTemplate {
    fn name(&self) -> &str {
        "wait"
    }

    fn task_kinds(&self) -> Vec<String> {
        vec!["wait".to_string()]
    }

    fn build(&self, user_parameters: &serde_json::Value) -> Result<Arc<dyn TaskChain>, ChainError> {
        let (total, steps) = Self::parse(user_parameters)?;
        Ok(Arc::new(WaitChain {
            state: ChainState::new("wait", steps),
            step: total / steps as u32,
            total,
        }))
    }
}

struct WaitChain {
    state: ChainState,
    step: Duration,
    total: Duration,
}

#[async_trait]
impl TaskChain for WaitChain {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn status(&self) -> ChainStatus {
        self.state.status()
    }

    fn detailed_progress(&self) -> ChainProgress {
        self.state.progress()
    }

    fn terminate(&self) {
        self.state.terminate();
    }

    async fn run(&self) -> Result<serde_json::Value, ChainError> {
        self.state.begin();
        self.state
            .set_meta(json!({"seconds": self.total.as_secs_f64()}));

        for _ in 0..self.state.progress().total {
            tokio::select! {
                _ = self.state.terminated() => {
                    self.state.record_error("terminated before completion");
                    self.state.finish(ChainStatus::Terminating);
                    return Err(ChainError::Terminated);
                }
                _ = tokio::time::sleep(self.step) => self.state.advance(),
            }
        }

        self.state.finish(ChainStatus::Complete);
        Ok(json!({"waited_seconds": self.total.as_secs_f64()}))
    }
}
