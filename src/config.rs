//! Configuration types.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, QueueError};

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Priority tiers this agent dequeues, most preferred first.
    pub accepted_priorities: Vec<i64>,
    /// How often a running chain's runner logs its progress.
    pub chain_progress_interval: Duration,
    /// Task kinds this agent refuses to run.
    pub chain_task_restrictions: Vec<String>,
    /// Upper bound on a single chain's execution.
    pub chain_timeout: Duration,
    /// Delay between intake loop iterations.
    pub queue_check_interval: Duration,
    /// Maximum number of concurrently admitted chains.
    pub max_chains: usize,
    /// Delay between status reporting cycles.
    pub reporting_interval: Duration,
    /// Key batch size hint for each queue scan.
    pub scan_batch: usize,
}

impl QueueConfig {
    /// Status snapshots outlive this many missed reporting cycles.
    pub const STATUS_TTL_MULTIPLIER: u32 = 10;

    /// Expiration applied to every status snapshot.
    pub fn status_ttl(&self) -> Duration {
        self.reporting_interval * Self::STATUS_TTL_MULTIPLIER
    }

    /// Check the values the background loops depend on.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.accepted_priorities.is_empty() {
            return Err(QueueError::InvalidConfig(
                "at least one accepted priority is required".to_string(),
            ));
        }
        if self.max_chains == 0 {
            return Err(QueueError::InvalidConfig(
                "max_chains must be greater than zero".to_string(),
            ));
        }
        if self.scan_batch == 0 {
            return Err(QueueError::InvalidConfig(
                "scan_batch must be greater than zero".to_string(),
            ));
        }
        for (name, interval) in [
            ("queue_check_interval", self.queue_check_interval),
            ("reporting_interval", self.reporting_interval),
            ("chain_progress_interval", self.chain_progress_interval),
            ("chain_timeout", self.chain_timeout),
        ] {
            if interval.is_zero() {
                return Err(QueueError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Load from `HARVEST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            accepted_priorities: match std::env::var("HARVEST_ACCEPTED_PRIORITIES") {
                Ok(raw) => parse_list("HARVEST_ACCEPTED_PRIORITIES", &raw)?,
                Err(_) => defaults.accepted_priorities,
            },
            chain_progress_interval: env_secs(
                "HARVEST_CHAIN_PROGRESS_INTERVAL_SECS",
                defaults.chain_progress_interval,
            )?,
            chain_task_restrictions: std::env::var("HARVEST_CHAIN_TASK_RESTRICTIONS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            chain_timeout: env_secs("HARVEST_CHAIN_TIMEOUT_SECS", defaults.chain_timeout)?,
            queue_check_interval: env_secs(
                "HARVEST_QUEUE_CHECK_INTERVAL_SECS",
                defaults.queue_check_interval,
            )?,
            max_chains: env_parse("HARVEST_MAX_CHAINS", defaults.max_chains)?,
            reporting_interval: env_secs(
                "HARVEST_REPORTING_INTERVAL_SECS",
                defaults.reporting_interval,
            )?,
            scan_batch: env_parse("HARVEST_QUEUE_SCAN_BATCH", defaults.scan_batch)?,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            accepted_priorities: vec![1, 2, 3, 4, 5],
            chain_progress_interval: Duration::from_secs(5),
            chain_task_restrictions: Vec::new(),
            chain_timeout: Duration::from_secs(3600), // 1 hour
            queue_check_interval: Duration::from_secs(1),
            max_chains: 10,
            reporting_interval: Duration::from_secs(5),
            scan_batch: 100,
        }
    }
}

/// Which store implementation backs the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Pending chain requests, keyed `{priority}:{identifier}`.
    pub queue_url: SecretString,
    /// Per-chain progress snapshots.
    pub status_url: SecretString,
    /// Final chain results.
    pub results_url: SecretString,
    pub pool_size: usize,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("HARVEST_STORE") {
            Ok(raw) => raw.parse::<StoreBackend>().map_err(|message| ConfigError::InvalidValue {
                key: "HARVEST_STORE".to_string(),
                message,
            })?,
            Err(_) => StoreBackend::Redis,
        };

        let url = |key: &str, default: &str| -> SecretString {
            SecretString::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
        };

        Ok(Self {
            backend,
            queue_url: url("HARVEST_QUEUE_REDIS_URL", "redis://127.0.0.1:6379/0"),
            status_url: url("HARVEST_STATUS_REDIS_URL", "redis://127.0.0.1:6379/1"),
            results_url: url("HARVEST_RESULTS_REDIS_URL", "redis://127.0.0.1:6379/2"),
            pool_size: env_parse("HARVEST_REDIS_POOL_SIZE", 16)?,
        })
    }
}

/// Agent process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name for identification in logs.
    pub name: String,
    /// Address the control API binds to.
    pub bind: SocketAddr,
    /// Drain timeout used when the stop endpoint does not supply one.
    pub stop_timeout: Duration,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<String>,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = match std::env::var("HARVEST_BIND") {
            Ok(raw) => raw.parse::<SocketAddr>().map_err(|e| ConfigError::InvalidValue {
                key: "HARVEST_BIND".to_string(),
                message: format!("{e}"),
            })?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 8000)),
        };

        Ok(Self {
            name: std::env::var("HARVEST_AGENT_NAME")
                .unwrap_or_else(|_| "harvest-agent".to_string()),
            bind,
            stop_timeout: env_secs("HARVEST_STOP_TIMEOUT_SECS", Duration::from_secs(60))?,
            log_dir: std::env::var("HARVEST_LOG_DIR").ok().filter(|s| !s.is_empty()),
            queue: QueueConfig::from_env()?,
            store: StoreConfig::from_env()?,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_list<T: FromStr>(key: &str, raw: &str) -> Result<Vec<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    split_list(raw)
        .iter()
        .map(|item| {
            item.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{item}': {e}"),
            })
        })
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
