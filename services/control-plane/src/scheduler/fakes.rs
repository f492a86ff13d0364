//! In-memory workspace and run services for scheduler tests.
//!
//! Every change is published on the same brokers the services hand out
//! subscriptions from, as the Postgres stores do through the outbox.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tfrun_events::Event;
use tfrun_id::{RunId, UserId, WorkspaceId};

use crate::db::DbError;
use crate::pubsub::{Broker, Subscription};
use crate::run::{ListRunsOptions, Run, RunService, RunStatus};
use crate::service::{Page, PageOptions, ServiceError, ServiceResult};
use crate::workspace::{LockHolder, Workspace, WorkspaceService};

/// A call the scheduler made against the fake services.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Lock(WorkspaceId, LockHolder),
    Unlock(WorkspaceId, LockHolder),
    SetCurrentRun(WorkspaceId, RunId),
    EnqueuePlan(RunId),
}

#[derive(Default)]
struct State {
    workspaces: Vec<Workspace>,
    runs: Vec<Run>,
    calls: Vec<Call>,
    fail_enqueue: bool,
}

pub struct FakeApp {
    state: Mutex<State>,
    workspace_events: Broker<Workspace>,
    run_events: Broker<Run>,
}

impl FakeApp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            workspace_events: Broker::new("workspaces"),
            run_events: Broker::new("runs"),
        })
    }

    pub fn workspace_events(&self) -> &Broker<Workspace> {
        &self.workspace_events
    }

    pub fn run_events(&self) -> &Broker<Run> {
        &self.run_events
    }

    pub fn add_workspace(&self, name: &str) -> Workspace {
        let ws = Workspace::new("acme", name);
        self.state.lock().unwrap().workspaces.push(ws.clone());
        self.workspace_events.publish(Event::created(ws.clone()));
        ws
    }

    pub fn add_run(&self, workspace_id: WorkspaceId, plan_only: bool) -> Run {
        let run = Run::new(workspace_id, plan_only);
        self.state.lock().unwrap().runs.push(run.clone());
        self.run_events.publish(Event::created(run.clone()));
        run
    }

    pub fn set_status(&self, run_id: RunId, status: RunStatus) -> Run {
        let run = {
            let mut state = self.state.lock().unwrap();
            let run = state.runs.iter_mut().find(|r| r.id == run_id).unwrap();
            run.status = status;
            run.clone()
        };
        self.run_events.publish(Event::updated(run.clone()));
        run
    }

    pub fn cancel(&self, run_id: RunId) -> Run {
        self.set_status(run_id, RunStatus::Canceled)
    }

    pub fn user_lock(&self, workspace_id: WorkspaceId, user: UserId) -> Workspace {
        self.change_workspace(workspace_id, |ws| ws.lock.lock(LockHolder::User(user)))
            .unwrap()
    }

    pub fn user_unlock(&self, workspace_id: WorkspaceId, user: UserId) -> Workspace {
        self.change_workspace(workspace_id, |ws| {
            ws.lock.unlock(LockHolder::User(user), false)
        })
        .unwrap()
    }

    pub fn delete_workspace(&self, workspace_id: WorkspaceId) -> Workspace {
        let ws = {
            let mut state = self.state.lock().unwrap();
            let idx = state
                .workspaces
                .iter()
                .position(|ws| ws.id == workspace_id)
                .unwrap();
            state.runs.retain(|run| run.workspace_id != workspace_id);
            state.workspaces.remove(idx)
        };
        self.workspace_events.publish(Event::deleted(ws.clone()));
        ws
    }

    pub fn fail_enqueue(&self) {
        self.state.lock().unwrap().fail_enqueue = true;
    }

    pub fn workspace(&self, workspace_id: WorkspaceId) -> Workspace {
        self.state
            .lock()
            .unwrap()
            .workspaces
            .iter()
            .find(|ws| ws.id == workspace_id)
            .cloned()
            .unwrap()
    }

    pub fn run(&self, run_id: RunId) -> Run {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .find(|run| run.id == run_id)
            .cloned()
            .unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn lock_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Lock(..)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn change_workspace<F, E>(&self, workspace_id: WorkspaceId, change: F) -> ServiceResult<Workspace>
    where
        F: FnOnce(&mut Workspace) -> Result<(), E>,
        ServiceError: From<E>,
    {
        let ws = {
            let mut state = self.state.lock().unwrap();
            let ws = state
                .workspaces
                .iter_mut()
                .find(|ws| ws.id == workspace_id)
                .ok_or_else(|| ServiceError::not_found("workspace", workspace_id))?;
            change(ws)?;
            ws.clone()
        };
        self.workspace_events.publish(Event::updated(ws.clone()));
        Ok(ws)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn page_of<T: Clone>(items: &[T], opts: PageOptions) -> Page<T> {
    let start = (opts.offset() as usize).min(items.len());
    let end = (start + opts.limit() as usize).min(items.len());
    Page::new(items[start..end].to_vec(), opts, items.len() as u64)
}

#[async_trait]
impl WorkspaceService for FakeApp {
    async fn list_workspaces(&self, opts: PageOptions) -> ServiceResult<Page<Workspace>> {
        Ok(page_of(&self.state.lock().unwrap().workspaces, opts))
    }

    fn watch_workspaces(&self) -> Subscription<Workspace> {
        self.workspace_events.subscribe()
    }

    async fn lock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
    ) -> ServiceResult<Workspace> {
        self.record(Call::Lock(workspace_id, holder));
        self.change_workspace(workspace_id, |ws| ws.lock.lock(holder))
    }

    async fn unlock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
        force: bool,
    ) -> ServiceResult<Workspace> {
        self.record(Call::Unlock(workspace_id, holder));
        self.change_workspace(workspace_id, |ws| ws.lock.unlock(holder, force))
    }

    async fn set_current_run(
        &self,
        workspace_id: WorkspaceId,
        run_id: RunId,
    ) -> ServiceResult<Workspace> {
        self.record(Call::SetCurrentRun(workspace_id, run_id));
        self.change_workspace(workspace_id, |ws| {
            ws.latest_run_id = Some(run_id);
            Ok::<_, ServiceError>(())
        })
    }
}

#[async_trait]
impl RunService for FakeApp {
    async fn list_runs(&self, opts: ListRunsOptions) -> ServiceResult<Page<Run>> {
        let runs: Vec<Run> = self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .rev()
            .filter(|run| !opts.incomplete_only || !run.done())
            .cloned()
            .collect();
        Ok(page_of(&runs, opts.page))
    }

    fn watch_runs(&self) -> Subscription<Run> {
        self.run_events.subscribe()
    }

    async fn enqueue_plan(&self, run_id: RunId) -> ServiceResult<Run> {
        self.record(Call::EnqueuePlan(run_id));
        let run = {
            let mut state = self.state.lock().unwrap();
            if state.fail_enqueue {
                return Err(ServiceError::Database(DbError::Query(
                    sqlx::Error::PoolTimedOut,
                )));
            }
            let run = state
                .runs
                .iter_mut()
                .find(|run| run.id == run_id)
                .ok_or_else(|| ServiceError::not_found("run", run_id))?;
            if run.status != RunStatus::Pending {
                return Err(ServiceError::InvalidRunStatus {
                    run_id: run_id.to_string(),
                    status: run.status.to_string(),
                    expected: "pending",
                });
            }
            run.status = RunStatus::PlanQueued;
            run.clone()
        };
        self.run_events.publish(Event::updated(run.clone()));
        Ok(run)
    }
}
