//! Workspaces: the resource runs contend for.
//!
//! The scheduler reads workspaces for their lock state and "latest run"
//! pointer, and changes them only through [`WorkspaceService`].

mod lock;
mod store;

pub use lock::{Lock, LockError, LockHolder, LockKind};
pub use store::WorkspaceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tfrun_id::{RunId, WorkspaceId};

use crate::pubsub::Subscription;
use crate::service::{Page, PageOptions, ServiceResult};

/// Snapshot of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub organization: String,
    #[serde(default)]
    pub lock: Lock,
    pub latest_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkspaceId::new(),
            name: name.into(),
            organization: organization.into(),
            lock: Lock::default(),
            latest_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl std::fmt::Display for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization, self.name)
    }
}

/// Workspace operations consumed by the scheduler.
///
/// Implementations apply lock and current-run changes transactionally and
/// return the workspace as it is after the change.
#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn list_workspaces(&self, opts: PageOptions) -> ServiceResult<Page<Workspace>>;

    /// Subscribe to workspace change events.
    fn watch_workspaces(&self) -> Subscription<Workspace>;

    async fn lock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
    ) -> ServiceResult<Workspace>;

    async fn unlock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
        force: bool,
    ) -> ServiceResult<Workspace>;

    /// Point the workspace's "latest run" at `run_id`.
    async fn set_current_run(
        &self,
        workspace_id: WorkspaceId,
        run_id: RunId,
    ) -> ServiceResult<Workspace>;
}
