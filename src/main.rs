use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use instancer::challenges::ChallengeCatalog;
use instancer::config::ManagerConfig;
use instancer::jobs::handle_job;
use instancer::redis_manager::RedisManager;
use instancer::runtime::{ContainerRuntime, DockerRuntime};
use instancer::sandbox::{
    Cleaner, ExpiryHandler, OrphanReconciler, ResourcePool, SandboxManager, SandboxRegistry,
};

/// How long one BLPOP waits before checking for shutdown
const POP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("instancer=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ManagerConfig::from_env()?;

    // Load challenge configurations
    let challenges_path =
        std::env::var("CHALLENGES_CONFIG").unwrap_or_else(|_| "./files/challenges.toml".into());
    let catalog = ChallengeCatalog::from_file(&challenges_path, &config)?;
    info!(
        "Loaded {} challenge configurations from {}",
        catalog.len(),
        challenges_path
    );

    info!("Starting Instancer...");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(config.docker.clone()));
    let pool = Arc::new(ResourcePool::new(config.default_pool_size));
    let registry = Arc::new(SandboxRegistry::new());
    let cleaner = Arc::new(Cleaner::new());
    let manager = Arc::new(SandboxManager::new(
        runtime.clone(),
        pool.clone(),
        registry.clone(),
        cleaner.clone(),
        catalog,
        config.clone(),
    ));

    // Ensure the container runtime is reachable; fail fast otherwise
    manager
        .ping()
        .await
        .context("Docker daemon is not reachable")?;
    info!("Confirmed Docker daemon is available");

    let cancel = CancellationToken::new();
    let cleaner_handle = tokio::spawn(
        cleaner
            .clone()
            .run(manager.clone() as Arc<dyn ExpiryHandler>, cancel.clone()),
    );

    let reconciler_handle = if config.reconcile.enabled {
        let reconciler = Arc::new(OrphanReconciler::new(
            runtime.clone(),
            pool.clone(),
            registry.clone(),
            config.managed_label.clone(),
            config.reconcile.effective_grace(),
        ));
        Some(tokio::spawn(
            reconciler.run(config.reconcile.interval, cancel.clone()),
        ))
    } else {
        info!("Orphan reconciliation disabled");
        None
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            cancel.cancel();
        });
    }

    let mut redis = RedisManager::from_env().await?;
    let publisher = redis.publisher().await?;

    info!("Waiting for jobs...");

    let mut jobs = tokio::task::JoinSet::new();
    while !cancel.is_cancelled() {
        let job = match redis.pop_job(POP_TIMEOUT).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                error!("Failed to pop job: {:#}", e);
                continue;
            }
        };

        info!(
            "Received {} job: request_id={}",
            job.kind(),
            job.request_id()
        );

        let manager = manager.clone();
        let mut publisher = publisher.clone();
        jobs.spawn(async move {
            let result = handle_job(&manager, job).await;
            if let Err(e) = publisher.store_result(&result).await {
                error!(
                    "Failed to store result for request {}: {:#}",
                    result.request_id, e
                );
            }
        });

        // Reap finished job tasks
        while jobs.try_join_next().is_some() {}
    }

    info!("Shutting down, waiting for {} in-flight jobs", jobs.len());
    while jobs.join_next().await.is_some() {}

    if let Err(e) = cleaner_handle.await {
        warn!("Cleaner task ended abnormally: {}", e);
    }
    if let Some(handle) = reconciler_handle {
        if let Err(e) = handle.await {
            warn!("Reconciler task ended abnormally: {}", e);
        }
    }

    manager.shutdown().await;
    info!("Instancer stopped");
    Ok(())
}
