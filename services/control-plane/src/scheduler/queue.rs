//! Per-workspace run queue.
//!
//! Each workspace has at most one `current` run, the only run allowed to hold
//! the workspace's run lock, followed by a FIFO of pending runs. Speculative
//! (plan-only) runs bypass the queue entirely.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::run::{Run, RunService, RunStatus};
use crate::service::ServiceResult;
use crate::workspace::{LockHolder, Workspace, WorkspaceService};

/// Handles the events of a single workspace and its runs.
#[async_trait]
pub trait QueueHandler: Send {
    async fn handle_workspace(&mut self, workspace: Workspace) -> ServiceResult<()>;
    async fn handle_run(&mut self, run: Run) -> ServiceResult<()>;
}

/// Constructs a queue for a newly seen workspace.
pub trait QueueFactory: Send + Sync {
    fn new_queue(&self, workspace: Workspace) -> Box<dyn QueueHandler>;
}

/// Builds [`WorkspaceQueue`]s backed by the given services.
#[derive(Clone)]
pub struct WorkspaceQueueFactory {
    workspaces: Arc<dyn WorkspaceService>,
    runs: Arc<dyn RunService>,
}

impl WorkspaceQueueFactory {
    pub fn new(workspaces: Arc<dyn WorkspaceService>, runs: Arc<dyn RunService>) -> Self {
        Self { workspaces, runs }
    }
}

impl QueueFactory for WorkspaceQueueFactory {
    fn new_queue(&self, workspace: Workspace) -> Box<dyn QueueHandler> {
        Box::new(WorkspaceQueue::new(
            Arc::clone(&self.workspaces),
            Arc::clone(&self.runs),
            workspace,
        ))
    }
}

pub struct WorkspaceQueue {
    workspaces: Arc<dyn WorkspaceService>,
    runs: Arc<dyn RunService>,
    workspace: Workspace,
    current: Option<Run>,
    pending: VecDeque<Run>,
}

impl WorkspaceQueue {
    pub fn new(
        workspaces: Arc<dyn WorkspaceService>,
        runs: Arc<dyn RunService>,
        workspace: Workspace,
    ) -> Self {
        Self {
            workspaces,
            runs,
            workspace,
            current: None,
            pending: VecDeque::new(),
        }
    }

    /// Last known snapshot of the workspace.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn current(&self) -> Option<&Run> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Run> {
        self.pending.iter()
    }

    /// Make `run` the current run, pointing the workspace at it if needed.
    async fn set_current_run(&mut self, run: Run) -> ServiceResult<()> {
        if self.workspace.latest_run_id != Some(run.id) {
            self.workspace = self
                .workspaces
                .set_current_run(self.workspace.id, run.id)
                .await?;
        }
        self.current = Some(run);
        Ok(())
    }

    /// Lock the workspace for `run` and queue its plan.
    ///
    /// Safe to call repeatedly: only a pending run is scheduled, and a user
    /// lock defers scheduling until the workspace changes again.
    async fn schedule_run(&mut self, run: Run) -> ServiceResult<()> {
        if run.status != RunStatus::Pending {
            return Ok(());
        }

        if self.workspace.lock.is_user_locked() {
            info!(
                workspace_id = %self.workspace.id,
                run_id = %run.id,
                "Workspace locked by user, deferring run"
            );
            return Ok(());
        }

        match self
            .workspaces
            .lock_workspace(self.workspace.id, LockHolder::Run(run.id))
            .await
        {
            Ok(workspace) => self.workspace = workspace,
            Err(e) if e.is_already_locked() => {
                info!(
                    workspace_id = %self.workspace.id,
                    run_id = %run.id,
                    "Workspace already locked, deferring run"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let run = self.runs.enqueue_plan(run.id).await?;
        debug!(workspace_id = %self.workspace.id, run_id = %run.id, "Enqueued plan");
        self.current = Some(run);
        Ok(())
    }

    /// The current run finished: hand over to the next run or unlock.
    async fn finish_current(&mut self, finished: Run) -> ServiceResult<()> {
        if let Some(next) = self.pending.pop_front() {
            self.set_current_run(next.clone()).await?;
            return self.schedule_run(next).await;
        }

        self.current = None;

        if self.workspace.lock.is_user_locked() {
            debug!(
                workspace_id = %self.workspace.id,
                run_id = %finished.id,
                "Workspace locked by user, leaving lock in place"
            );
            return Ok(());
        }

        match self
            .workspaces
            .unlock_workspace(self.workspace.id, LockHolder::Run(finished.id), false)
            .await
        {
            Ok(workspace) => {
                self.workspace = workspace;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(workspace_id = %self.workspace.id, "Workspace gone, nothing to unlock");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl QueueHandler for WorkspaceQueue {
    async fn handle_workspace(&mut self, workspace: Workspace) -> ServiceResult<()> {
        self.workspace = workspace;
        match self.current.clone() {
            Some(current) => self.schedule_run(current).await,
            None => Ok(()),
        }
    }

    #[instrument(
        skip(self, run),
        fields(workspace_id = %run.workspace_id, run_id = %run.id, status = %run.status)
    )]
    async fn handle_run(&mut self, run: Run) -> ServiceResult<()> {
        if run.plan_only {
            if run.status == RunStatus::Pending {
                match self.runs.enqueue_plan(run.id).await {
                    Ok(_) => {}
                    // A late event for a speculative run that was already queued.
                    Err(e) if e.is_invalid_run_status() => {
                        debug!(run_id = %run.id, error = %e, "Speculative run already enqueued");
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }

        if let Some(current) = &self.current {
            if current.id == run.id {
                if run.done() {
                    return self.finish_current(run).await;
                }
                // Status updates for the current run need no action, and a
                // late event may carry an older status than the one held.
                return Ok(());
            }
        } else {
            if run.done() {
                return Ok(());
            }
            self.set_current_run(run.clone()).await?;
            return self.schedule_run(run).await;
        }

        match self.pending.iter().position(|queued| queued.id == run.id) {
            Some(idx) if run.done() => {
                self.pending.remove(idx);
            }
            Some(idx) => self.pending[idx] = run,
            None if run.done() => {}
            None => self.pending.push_back(run),
        }
        Ok(())
    }
}
