//! Harvest agent: admission-controlled worker for prioritized task chains.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod payload;
pub mod queue;
pub mod store;
