//! Run scheduling.
//!
//! - [`WorkspaceQueue`]: per-workspace FIFO deciding which run holds the lock
//! - [`Scheduler`]: event loop feeding workspace and run events to queues
//! - [`SchedulerWorker`]: runs the scheduler under a cluster-wide advisory lock

mod queue;
mod reconciler;
mod worker;

#[cfg(test)]
mod fakes;

pub use queue::{QueueFactory, QueueHandler, WorkspaceQueue, WorkspaceQueueFactory};
pub use reconciler::Scheduler;
pub use worker::{SchedulerWorker, SchedulerWorkerConfig};

use crate::db::DbError;
use crate::service::ServiceError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that stop the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("{0} subscription terminated")]
    SubscriptionTerminated(&'static str),

    #[error("database error: {0}")]
    Database(#[from] DbError),
}
