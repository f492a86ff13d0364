//! Runs: requests to plan/apply against a workspace.
//!
//! The scheduler observes run status and asks the [`RunService`] to enqueue
//! plans; it never changes a run's status itself.

mod store;

pub use store::RunStore;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tfrun_id::{RunId, WorkspaceId};
use thiserror::Error;

use crate::pubsub::Subscription;
use crate::service::{Page, PageOptions, ServiceResult};

/// Run status, using the TFE status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Discarded,
    Canceled,
    ForceCanceled,
    Errored,
}

/// Statuses from which a run never moves again.
pub const DONE_STATUSES: &[RunStatus] = &[
    RunStatus::Applied,
    RunStatus::PlannedAndFinished,
    RunStatus::Discarded,
    RunStatus::Canceled,
    RunStatus::ForceCanceled,
    RunStatus::Errored,
];

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::PlanQueued => "plan_queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::PlannedAndFinished => "planned_and_finished",
            RunStatus::ApplyQueued => "apply_queued",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Discarded => "discarded",
            RunStatus::Canceled => "canceled",
            RunStatus::ForceCanceled => "force_canceled",
            RunStatus::Errored => "errored",
        }
    }

    pub fn is_done(&self) -> bool {
        DONE_STATUSES.contains(self)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown run status: {0}")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => RunStatus::Pending,
            "plan_queued" => RunStatus::PlanQueued,
            "planning" => RunStatus::Planning,
            "planned" => RunStatus::Planned,
            "planned_and_finished" => RunStatus::PlannedAndFinished,
            "apply_queued" => RunStatus::ApplyQueued,
            "applying" => RunStatus::Applying,
            "applied" => RunStatus::Applied,
            "discarded" => RunStatus::Discarded,
            "canceled" => RunStatus::Canceled,
            "force_canceled" => RunStatus::ForceCanceled,
            "errored" => RunStatus::Errored,
            other => return Err(UnknownRunStatus(other.to_string())),
        };
        Ok(status)
    }
}

/// Snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    /// Speculative runs only plan and never change workspace state.
    pub plan_only: bool,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// A new pending run.
    pub fn new(workspace_id: WorkspaceId, plan_only: bool) -> Self {
        Self {
            id: RunId::new(),
            workspace_id,
            status: RunStatus::Pending,
            plan_only,
            created_at: Utc::now(),
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_done()
    }
}

/// Options for listing runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListRunsOptions {
    pub page: PageOptions,
    /// Only return runs that are not done.
    pub incomplete_only: bool,
}

/// Run operations consumed by the scheduler.
#[async_trait]
pub trait RunService: Send + Sync {
    /// List runs, newest first.
    async fn list_runs(&self, opts: ListRunsOptions) -> ServiceResult<Page<Run>>;

    /// Subscribe to run change events.
    fn watch_runs(&self) -> Subscription<Run>;

    /// Move a pending run to `plan_queued`.
    async fn enqueue_plan(&self, run_id: RunId) -> ServiceResult<Run>;
}
