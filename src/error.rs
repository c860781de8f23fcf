//! Error types for the harvest agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors talking to the queue, status or result store.
///
/// All of these are treated as transient by the background loops.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Redis command failed: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a chain could not be admitted into the job queue.
///
/// Admission errors never mutate the in-flight table.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Chain template {name} not found")]
    TemplateNotFound { name: String },

    #[error("Chain {id} is already admitted")]
    DuplicateIdentifier { id: String },

    #[error("Job queue is full ({capacity} chains)")]
    QueueFull { capacity: usize },

    #[error("Chain template {name} uses restricted task kind {kind}")]
    Restricted { name: String, kind: String },

    #[error("Job queue is not accepting chains while {status}")]
    NotAccepting { status: String },

    #[error("Invalid queue entry: {0}")]
    InvalidPayload(String),

    #[error("Chain template {name} rejected parameters: {reason}")]
    Build { name: String, reason: String },
}

/// Job queue lifecycle and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Chain {id} not found")]
    ChainNotFound { id: String },

    #[error("Failed to launch {name} loop: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while a chain executes.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Chain was terminated")]
    Terminated,

    #[error("Chain timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Chain failed: {0}")]
    Failed(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameters { name: String, reason: String },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
