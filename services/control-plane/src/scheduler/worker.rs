//! Scheduler background worker.
//!
//! Only one scheduler may run in a cluster. The worker waits for the
//! scheduler advisory lock, runs the scheduler while holding it and restarts
//! it with backoff when it fails.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use super::reconciler::Scheduler;
use super::SchedulerResult;
use crate::backoff::BackoffPolicy;
use crate::db::{AdvisoryLock, SCHEDULER_LOCK_ID};

/// Configuration for the scheduler worker.
#[derive(Debug, Clone)]
pub struct SchedulerWorkerConfig {
    /// How often to retry the advisory lock while another instance holds it.
    pub lock_retry_interval: Duration,

    /// Delay between restarts after a failure.
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerWorkerConfig {
    fn default() -> Self {
        Self {
            lock_retry_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct SchedulerWorker {
    pool: PgPool,
    scheduler: Scheduler,
    config: SchedulerWorkerConfig,
}

impl SchedulerWorker {
    pub fn new(pool: PgPool, scheduler: Scheduler, config: SchedulerWorkerConfig) -> Self {
        Self {
            pool,
            scheduler,
            config,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "scheduler_worker")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            lock_id = SCHEDULER_LOCK_ID,
            lock_retry_secs = self.config.lock_retry_interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                info!("Scheduler worker shutting down");
                break;
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    let delay = self.config.backoff.delay(attempt);
                    error!(
                        error = %e,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Scheduler failed, restarting"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("Scheduler worker shutting down");
                                break;
                            }
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Hold the scheduler lock for one run of the scheduler.
    async fn run_once(&mut self, shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        let lock = AdvisoryLock::acquire(
            &self.pool,
            SCHEDULER_LOCK_ID,
            self.config.lock_retry_interval,
            shutdown.clone(),
        )
        .await?;
        let Some(lock) = lock else {
            return Ok(());
        };
        info!(lock_id = lock.id(), "Acquired scheduler lock");

        let result = self.scheduler.start(shutdown).await;

        if let Err(e) = lock.release().await {
            warn!(error = %e, "Failed to release scheduler lock");
        }
        result
    }
}
