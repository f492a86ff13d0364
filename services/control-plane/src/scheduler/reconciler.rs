//! The scheduler: routes workspace and run events to per-workspace queues.
//!
//! On start the scheduler subscribes to both event streams, replays the
//! current state (every workspace, then every incomplete run oldest first)
//! and then relays live events. A single loop owns every queue, so no queue
//! state is shared between tasks.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tfrun_events::{Event, EventType};
use tfrun_id::WorkspaceId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use super::queue::{QueueFactory, QueueHandler, WorkspaceQueueFactory};
use super::{SchedulerError, SchedulerResult};
use crate::pubsub::Subscription;
use crate::run::{ListRunsOptions, Run, RunService};
use crate::service::list_all;
use crate::workspace::{Workspace, WorkspaceService};

pub struct Scheduler {
    workspaces: Arc<dyn WorkspaceService>,
    runs: Arc<dyn RunService>,
    factory: Arc<dyn QueueFactory>,
    queues: HashMap<WorkspaceId, Box<dyn QueueHandler>>,
}

impl Scheduler {
    pub fn new(workspaces: Arc<dyn WorkspaceService>, runs: Arc<dyn RunService>) -> Self {
        let factory = Arc::new(WorkspaceQueueFactory::new(
            Arc::clone(&workspaces),
            Arc::clone(&runs),
        ));
        Self {
            workspaces,
            runs,
            factory,
            queues: HashMap::new(),
        }
    }

    /// Replace the factory used to build per-workspace queues.
    pub fn with_queue_factory(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Number of workspaces with a queue.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Schedule runs until shutdown is signaled or an error occurs.
    ///
    /// All queue state is rebuilt from scratch on every call.
    #[instrument(skip(self, shutdown), name = "scheduler")]
    pub async fn start(&mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        self.queues.clear();

        // Subscribe before listing so nothing between the two is missed.
        let workspace_sub = self.workspaces.watch_workspaces();
        let run_sub = self.runs.watch_runs();

        let workspaces = {
            let service = Arc::clone(&self.workspaces);
            list_all(|page| {
                let service = Arc::clone(&service);
                async move { service.list_workspaces(page).await }
            })
            .await?
        };
        let mut runs = {
            let service = Arc::clone(&self.runs);
            list_all(|page| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .list_runs(ListRunsOptions {
                            page,
                            incomplete_only: true,
                        })
                        .await
                }
            })
            .await?
        };
        // Listed newest first; replay oldest first.
        runs.reverse();

        info!(
            workspaces = workspaces.len(),
            runs = runs.len(),
            "Scheduler started"
        );

        let (workspace_tx, mut workspace_rx) = mpsc::unbounded_channel();
        let (run_tx, mut run_rx) = mpsc::unbounded_channel();
        for ws in workspaces {
            let _ = workspace_tx.send(Event::created(ws));
        }
        for run in runs {
            let _ = run_tx.send(Event::updated(run));
        }

        // Aborted when dropped on return.
        let mut forwarders = JoinSet::new();
        forwarders.spawn(forward(workspace_sub, workspace_tx));
        forwarders.spawn(forward(run_sub, run_tx));

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping scheduler");
                return Ok(());
            }

            // Workspace events go first so a run's queue exists before the run.
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        return Ok(());
                    }
                }
                event = workspace_rx.recv() => match event {
                    Some(event) => self.handle_workspace_event(event).await?,
                    None => return Err(SchedulerError::SubscriptionTerminated("workspaces")),
                },
                event = run_rx.recv() => match event {
                    Some(event) => self.handle_run_event(event).await?,
                    None => return Err(SchedulerError::SubscriptionTerminated("runs")),
                },
            }
        }
    }

    async fn handle_workspace_event(&mut self, event: Event<Workspace>) -> SchedulerResult<()> {
        let ws = event.payload;

        if event.event_type == EventType::Deleted {
            if self.queues.remove(&ws.id).is_some() {
                debug!(workspace_id = %ws.id, "Removed workspace queue");
            }
            return Ok(());
        }

        let queue = match self.queues.entry(ws.id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(workspace_id = %ws.id, "Created workspace queue");
                entry.insert(self.factory.new_queue(ws.clone()))
            }
        };
        queue.handle_workspace(ws).await?;
        Ok(())
    }

    async fn handle_run_event(&mut self, event: Event<Run>) -> SchedulerResult<()> {
        if event.event_type == EventType::Deleted {
            return Ok(());
        }

        let run = event.payload;
        match self.queues.get_mut(&run.workspace_id) {
            Some(queue) => queue.handle_run(run).await?,
            None => error!(
                workspace_id = %run.workspace_id,
                run_id = %run.id,
                "No queue for run's workspace, dropping event"
            ),
        }
        Ok(())
    }
}

/// Relay events from a subscription until either side goes away.
async fn forward<T>(mut sub: Subscription<T>, tx: mpsc::UnboundedSender<Event<T>>)
where
    T: Send + 'static,
{
    while let Some(event) = sub.recv().await {
        if tx.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::SUBSCRIBER_BUFFER;
    use crate::run::RunStatus;
    use crate::scheduler::fakes::FakeApp;
    use crate::workspace::LockHolder;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    type Running = (
        watch::Sender<bool>,
        JoinHandle<(Scheduler, SchedulerResult<()>)>,
    );

    fn scheduler_for(app: &Arc<FakeApp>) -> Scheduler {
        let workspaces: Arc<dyn WorkspaceService> = app.clone();
        let runs: Arc<dyn RunService> = app.clone();
        Scheduler::new(workspaces, runs)
    }

    fn spawn(mut scheduler: Scheduler) -> Running {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = scheduler.start(shutdown_rx).await;
            (scheduler, result)
        });
        (shutdown_tx, handle)
    }

    async fn stop((shutdown_tx, handle): Running) -> Scheduler {
        shutdown_tx.send(true).unwrap();
        let (scheduler, result) = handle.await.unwrap();
        result.unwrap();
        scheduler
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    struct RecordingFactory {
        inner: WorkspaceQueueFactory,
        created: Arc<Mutex<Vec<WorkspaceId>>>,
    }

    impl QueueFactory for RecordingFactory {
        fn new_queue(&self, workspace: Workspace) -> Box<dyn QueueHandler> {
            self.created.lock().unwrap().push(workspace.id);
            self.inner.new_queue(workspace)
        }
    }

    #[tokio::test]
    async fn test_existing_runs_are_replayed_oldest_first() {
        let app = FakeApp::new();
        let ws = app.add_workspace("dev");
        let r1 = app.add_run(ws.id, false);
        let r2 = app.add_run(ws.id, false);
        let r3 = app.add_run(ws.id, false);

        let running = spawn(scheduler_for(&app));
        eventually(|| app.run(r1.id).status == RunStatus::PlanQueued).await;
        assert_eq!(app.workspace(ws.id).lock.holder(), Some(LockHolder::Run(r1.id)));
        assert_eq!(app.run(r2.id).status, RunStatus::Pending);
        assert_eq!(app.run(r3.id).status, RunStatus::Pending);

        app.set_status(r1.id, RunStatus::Applied);
        eventually(|| app.run(r2.id).status == RunStatus::PlanQueued).await;
        assert_eq!(app.workspace(ws.id).lock.holder(), Some(LockHolder::Run(r2.id)));
        assert_eq!(app.run(r3.id).status, RunStatus::Pending);

        let scheduler = stop(running).await;
        assert_eq!(scheduler.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_live_events_are_scheduled() {
        let app = FakeApp::new();
        let running = spawn(scheduler_for(&app));
        eventually(|| app.run_events().subscriber_count() == 1).await;

        let ws = app.add_workspace("dev");
        let run = app.add_run(ws.id, false);
        eventually(|| app.run(run.id).status == RunStatus::PlanQueued).await;

        app.cancel(run.id);
        eventually(|| !app.workspace(ws.id).locked()).await;

        stop(running).await;
    }

    #[tokio::test]
    async fn test_run_without_queue_is_dropped() {
        let app = FakeApp::new();
        let running = spawn(scheduler_for(&app));
        eventually(|| app.run_events().subscriber_count() == 1).await;

        app.run_events()
            .publish(Event::created(Run::new(WorkspaceId::new(), false)));

        // The loop keeps going.
        let ws = app.add_workspace("dev");
        let run = app.add_run(ws.id, false);
        eventually(|| app.run(run.id).status == RunStatus::PlanQueued).await;

        stop(running).await;
    }

    #[tokio::test]
    async fn test_deleted_workspace_drops_queue() {
        let app = FakeApp::new();
        let created = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(RecordingFactory {
            inner: WorkspaceQueueFactory::new(app.clone(), app.clone()),
            created: Arc::clone(&created),
        });
        let ws = app.add_workspace("dev");
        let running = spawn(scheduler_for(&app).with_queue_factory(factory));
        eventually(|| created.lock().unwrap().len() == 1).await;

        app.delete_workspace(ws.id);
        app.workspace_events().publish(Event::updated(ws.clone()));
        eventually(|| created.lock().unwrap().len() == 2).await;
        assert_eq!(*created.lock().unwrap(), vec![ws.id, ws.id]);

        stop(running).await;
    }

    #[tokio::test]
    async fn test_evicted_subscription_terminates() {
        let app = FakeApp::new();
        let (_shutdown_tx, handle) = spawn(scheduler_for(&app));
        eventually(|| app.run_events().subscriber_count() == 1).await;

        // Nothing yields in between, so the forwarder cannot keep up.
        for _ in 0..=SUBSCRIBER_BUFFER {
            app.run_events()
                .publish(Event::created(Run::new(WorkspaceId::new(), false)));
        }

        let (_, result) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SchedulerError::SubscriptionTerminated("runs"))
        ));
    }

    #[tokio::test]
    async fn test_late_insert_event_after_replay_is_harmless() {
        let app = FakeApp::new();
        let ws = app.add_workspace("dev");
        let r1 = app.add_run(ws.id, false);

        let running = spawn(scheduler_for(&app));
        eventually(|| app.run(r1.id).status == RunStatus::PlanQueued).await;

        // The insert arrives only after the snapshot already scheduled r1.
        app.run_events().publish(Event::created(r1.clone()));
        app.workspace_events()
            .publish(Event::updated(app.workspace(ws.id)));

        // Later events are still handled, so the loop survived the above.
        let other = app.add_workspace("prod");
        let r2 = app.add_run(other.id, false);
        eventually(|| app.run(r2.id).status == RunStatus::PlanQueued).await;

        assert_eq!(app.workspace(ws.id).lock.holder(), Some(LockHolder::Run(r1.id)));
        stop(running).await;
    }

    #[tokio::test]
    async fn test_handler_error_stops_scheduler() {
        let app = FakeApp::new();
        let ws = app.add_workspace("dev");
        app.add_run(ws.id, false);
        app.fail_enqueue();

        let (_shutdown_tx, handle) = spawn(scheduler_for(&app));
        let (_, result) = handle.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::Service(_))));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_returns_immediately() {
        let app = FakeApp::new();
        let mut scheduler = scheduler_for(&app);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        tokio::time::timeout(Duration::from_secs(1), scheduler.start(shutdown_rx))
            .await
            .expect("scheduler did not stop")
            .unwrap();
        eventually(|| app.run_events().subscriber_count() == 0).await;
    }
}
