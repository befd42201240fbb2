use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use robotq_core::runner::robot::RobotRunner;
use robotq_db::store::{PgStore, SharedStore};
use robotq_storage::{ArtifactStore, LocalArtifactStore, S3ArtifactStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use robotq_worker::config::{ArtifactBackend, LogFormat, WorkerConfig};
use robotq_worker::dispatcher::Dispatcher;
use robotq_worker::reaper::{ReaperSettings, StaleClaimReaper};
use robotq_worker::worker_pool::{PoolSettings, WorkerPool};

const DEFAULT_FILTER: &str = "robotq_worker=debug,robotq_core=info,robotq_db=info,robotq_storage=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
    tracing::info!(
        workers = config.workers,
        max_attempts = config.max_attempts,
        default_timeout_secs = config.limits.default_timeout.as_secs(),
        max_timeout_secs = config.limits.max_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = robotq_db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    robotq_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    robotq_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let store: SharedStore = Arc::new(PgStore::new(pool));

    // --- Artifact storage ---
    let artifacts = build_artifact_store(&config.artifacts).await?;

    // --- Dispatcher ---
    let runner = Arc::new(RobotRunner::new(config.robot.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        runner,
        artifacts,
        config.limits,
    ));

    // --- Stale claim reaper ---
    let reaper_cancel = CancellationToken::new();
    let reaper = StaleClaimReaper::new(
        Arc::clone(&store),
        ReaperSettings::new(&config.reaper, config.max_attempts),
    );
    let reaper_handle = tokio::spawn(reaper.run(reaper_cancel.clone()));

    // --- Workers ---
    let workers = WorkerPool::start(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        PoolSettings {
            workers: config.workers,
            poll_interval: config.poll_interval,
        },
    );

    shutdown_signal().await;
    tracing::info!(
        active_runs = dispatcher.active_runs(),
        grace_secs = config.shutdown_timeout.as_secs(),
        "Shutdown requested, waiting for in-flight runs",
    );

    let aborted = workers.shutdown(config.shutdown_timeout).await;
    if aborted > 0 {
        tracing::warn!(aborted, "Claimed items of aborted workers are left to the reaper");
    }

    reaper_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), reaper_handle).await;
    tracing::info!("Stale claim reaper stopped");

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn build_artifact_store(backend: &ArtifactBackend) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    match backend {
        ArtifactBackend::S3(s3) => {
            let store = S3ArtifactStore::connect(s3).await;
            store
                .ensure_bucket()
                .await
                .with_context(|| format!("Failed to prepare bucket {}", s3.bucket))?;
            tracing::info!(bucket = %s3.bucket, endpoint = ?s3.endpoint, "Using S3 artifact storage");
            Ok(Arc::new(store))
        }
        ArtifactBackend::Local(root) => {
            let store = LocalArtifactStore::new(root.clone())
                .await
                .with_context(|| format!("Failed to prepare artifact directory {}", root.display()))?;
            tracing::info!(root = %store.root().display(), "Using local artifact storage");
            Ok(Arc::new(store))
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal
/// is ignored; the other one still triggers shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
