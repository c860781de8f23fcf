use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;

use harvest_agent::api::queue_routes;
use harvest_agent::chain::TemplateRegistry;
use harvest_agent::config::{AgentConfig, StoreBackend, StoreConfig};
use harvest_agent::queue::{JobQueue, JobQueueDeps};
use harvest_agent::store::{MemoryStore, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("🌾 Harvest agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Name: {}", config.name);
    eprintln!("   Control API: http://{}/queue/status", config.bind);
    eprintln!("   Priorities: {:?}", config.queue.accepted_priorities);
    eprintln!("   Capacity: {} chains\n", config.queue.max_chains);

    // ── Stores ───────────────────────────────────────────────────────────
    let deps = build_deps(&config.store).await?;

    // ── Job queue ────────────────────────────────────────────────────────
    let queue = JobQueue::new(config.queue.clone(), deps);
    let started = queue.start().await;
    if !started.result {
        anyhow::bail!(started.message);
    }

    // ── Control API ──────────────────────────────────────────────────────
    let app = queue_routes(Arc::clone(&queue), config.stop_timeout);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind control API on {}", config.bind))?;
    tracing::info!(addr = %config.bind, agent = %config.name, "Control API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Control API failed")?;

    // A stop may already have come in over the API.
    let stopped = queue.stop(true, config.stop_timeout).await;
    if !stopped.result {
        tracing::warn!(status = %stopped.status, "{}", stopped.message);
    }
    queue.complete().await;

    Ok(())
}

/// Read the environment and reject a queue config the loops cannot run with.
fn load_config() -> harvest_agent::error::Result<AgentConfig> {
    let config = AgentConfig::from_env()?;
    config.queue.validate()?;
    Ok(config)
}

fn init_tracing(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "harvest-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn build_deps(store: &StoreConfig) -> anyhow::Result<JobQueueDeps> {
    let factory = Arc::new(TemplateRegistry::with_builtins());
    tracing::info!(
        count = factory.count(),
        templates = %factory.list().await.join(", "),
        "Chain templates registered"
    );

    match store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; queued work is lost on exit");
            let memory = Arc::new(MemoryStore::new());
            Ok(JobQueueDeps {
                factory,
                queue_store: memory.clone(),
                status_store: memory.clone(),
                result_store: memory,
            })
        }
        StoreBackend::Redis => {
            let queue_store = connect_redis("queue", &store.queue_url, store.pool_size).await?;
            let status_store = connect_redis("status", &store.status_url, store.pool_size).await?;
            let result_store =
                connect_redis("results", &store.results_url, store.pool_size).await?;
            Ok(JobQueueDeps {
                factory,
                queue_store,
                status_store,
                result_store,
            })
        }
    }
}

async fn connect_redis(
    silo: &str,
    url: &secrecy::SecretString,
    pool_size: usize,
) -> anyhow::Result<Arc<RedisStore>> {
    let store = RedisStore::connect(url, pool_size)
        .with_context(|| format!("Failed to create {silo} store pool"))?;
    store
        .ping()
        .await
        .with_context(|| format!("Failed to reach {silo} store"))?;
    tracing::info!(silo, "Redis store connected");
    Ok(Arc::new(store))
}
