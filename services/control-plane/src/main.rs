//! tfrun Control Plane
//!
//! Runs the outbox listener feeding the workspace and run brokers, and the
//! run scheduler, until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tfrun_control_plane::{
    backoff::BackoffPolicy,
    config,
    db::Database,
    pubsub::{Broker, Listener},
    run::{Run, RunService, RunStore},
    scheduler::{Scheduler, SchedulerWorker},
    workspace::{Workspace, WorkspaceService, WorkspaceStore},
};
use tfrun_events::tables;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TFRUN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tfrun control plane");

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if let Err(e) = db.health_check().await {
        error!(error = %e, "Database health check failed");
        return Err(e.into());
    }

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    match db.outbox_store().pending_count().await {
        Ok(pending) => info!(pending = pending, "Outbox rows awaiting delivery"),
        Err(e) => warn!(error = %e, "Failed to count outbox rows"),
    }

    // Change notification: outbox -> listener -> brokers
    let workspace_events: Broker<Workspace> = Broker::new(tables::WORKSPACES);
    let run_events: Broker<Run> = Broker::new(tables::RUNS);

    let listener = Arc::new(Listener::new(db.outbox_store(), config.listener.clone()));
    listener.register_table(tables::WORKSPACES, workspace_events.table_callback());
    listener.register_table(tables::RUNS, run_events.table_callback());

    let workspaces: Arc<dyn WorkspaceService> = Arc::new(WorkspaceStore::new(
        db.pool().clone(),
        workspace_events.clone(),
    ));
    let runs: Arc<dyn RunService> = Arc::new(RunStore::new(db.pool().clone(), run_events.clone()));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start outbox listener in background, restarting it on failure
    let listener_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let backoff = BackoffPolicy::default();
            let mut attempt: u32 = 0;
            loop {
                match listener.run(shutdown_rx.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = backoff.delay(attempt);
                        error!(error = %e, attempt = attempt, "Outbox listener failed, restarting");
                        attempt = attempt.saturating_add(1);
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }
    });

    // Start scheduler worker in background
    let scheduler_worker = SchedulerWorker::new(
        db.pool().clone(),
        Scheduler::new(workspaces, runs),
        config.scheduler.clone(),
    );
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, listener_handle).await {
        warn!(error = %e, "Outbox listener did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
