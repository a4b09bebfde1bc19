// Weft worker

mod config;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_engine::{
    CallGuards, DbStateBackend, Engine, GuardConfig, ModuleRegistry, PgWorkQueue, RunPipeline,
    Scheduler, Vault, WorkQueue, WorkerConfig, WorkerPool,
};
use weft_storage::{Database, SecretCipher};

use config::WorkerSettings;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_worker=debug,weft_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = WorkerSettings::from_env()?;
    tracing::info!(worker = %settings.worker_name, concurrency = settings.concurrency, "weft-worker starting");

    let db = Database::from_url(&settings.database_url).await?;
    db.migrate().await?;
    tracing::info!("database connection established");

    let cipher = SecretCipher::from_env()?;

    // Module registry is read-only after this point
    let mut registry = ModuleRegistry::new();
    if settings.skip_module_preload {
        tracing::warn!("module preload skipped (SKIP_MODULE_PRELOAD)");
    } else {
        registry.preload();
    }
    let registry = Arc::new(registry);

    let guards = Arc::new(CallGuards::new(GuardConfig::default()));
    let engine = Arc::new(
        Engine::new(Arc::clone(&registry), guards)
            .with_state_backend(Arc::new(DbStateBackend::new(db.clone())))
            .with_env(settings.env_whitelist.clone()),
    );

    let vault = Arc::new(Vault::new(db.clone(), cipher));
    let invalidation_listener = Arc::clone(&vault).spawn_invalidation_listener();

    // Warm the cache for the most recently active users
    let recent_users = db
        .list_recently_active_users(settings.credential_warm_count)
        .await
        .unwrap_or_default();
    vault.warm_cache(&recent_users).await;

    let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(db.pool().clone()));

    let scheduler = Scheduler::new(db.clone(), Arc::clone(&queue));
    scheduler.refresh().await?;
    let scheduler_handle = scheduler.start();

    let pipeline = Arc::new(RunPipeline::new(
        db.clone(),
        Arc::clone(&vault),
        Arc::clone(&engine),
    ));
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        pipeline,
        WorkerConfig::default()
            .with_worker_name(settings.worker_name.clone())
            .with_concurrency(settings.concurrency),
    );
    pool.start();
    tracing::info!("worker ready to execute workflows");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    // Ordered shutdown: stop enqueueing, stop claiming, drain, then close
    // connections. Out of order leaves orphaned heartbeats.
    scheduler.shutdown();
    scheduler_handle.abort();
    if let Err(e) = pool.shutdown().await {
        tracing::warn!("worker pool shutdown: {e}");
    }
    invalidation_listener.abort();
    db.close().await;

    tracing::info!("weft-worker stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
