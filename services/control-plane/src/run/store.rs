//! Postgres-backed run service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tfrun_events::{tables, Action};
use tfrun_id::{RunId, WorkspaceId};
use tracing::{debug, instrument};

use super::{ListRunsOptions, Run, RunService, RunStatus, DONE_STATUSES};
use crate::db::OutboxStore;
use crate::pubsub::{Broker, Subscription};
use crate::service::{Page, ServiceError, ServiceResult};

const SELECT_COLUMNS: &str = "id, workspace_id, status, plan_only, created_at";

struct RunRow(Run);

fn decode_err(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

impl<'r> sqlx::FromRow<'r, PgRow> for RunRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let workspace_id: String = row.try_get("workspace_id")?;
        let status: String = row.try_get("status")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Self(Run {
            id: id.parse::<RunId>().map_err(decode_err)?,
            workspace_id: workspace_id.parse::<WorkspaceId>().map_err(decode_err)?,
            status: status.parse::<RunStatus>().map_err(decode_err)?,
            plan_only: row.try_get("plan_only")?,
            created_at,
        }))
    }
}

/// Run service over the `runs` table.
#[derive(Clone)]
pub struct RunStore {
    pool: PgPool,
    broker: Broker<Run>,
}

impl RunStore {
    /// `broker` must be the broker the listener feeds with `runs` rows.
    pub fn new(pool: PgPool, broker: Broker<Run>) -> Self {
        Self { pool, broker }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, workspace_id: WorkspaceId, plan_only: bool) -> ServiceResult<Run> {
        let run = Run::new(workspace_id, plan_only);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, workspace_id, status, plan_only, created_at)
            SELECT $1, id, $3, $4, $5 FROM workspaces WHERE id = $2
            "#,
        )
        .bind(run.id.to_string())
        .bind(workspace_id.to_string())
        .bind(run.status.as_str())
        .bind(run.plan_only)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("workspace", workspace_id));
        }

        OutboxStore::append_in_tx(&mut tx, tables::RUNS, Action::Insert, &run).await?;
        tx.commit().await?;

        debug!(run_id = %run.id, "Created run");
        Ok(run)
    }

    pub async fn get(&self, run_id: RunId) -> ServiceResult<Run> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM runs WHERE id = $1");
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.0)
            .ok_or_else(|| ServiceError::not_found("run", run_id))
    }

    /// Cancel a run that is not yet done.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: RunId) -> ServiceResult<Run> {
        self.transition(run_id, RunStatus::Canceled, |status| !status.is_done(), "not done")
            .await
    }

    /// Move a run to `to` if `allowed` accepts its current status.
    async fn transition<P>(
        &self,
        run_id: RunId,
        to: RunStatus,
        allowed: P,
        expected: &'static str,
    ) -> ServiceResult<Run>
    where
        P: FnOnce(RunStatus) -> bool + Send,
    {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {SELECT_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE");
        let mut run = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.0)
            .ok_or_else(|| ServiceError::not_found("run", run_id))?;

        if !allowed(run.status) {
            return Err(ServiceError::InvalidRunStatus {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
                expected,
            });
        }

        run.status = to;
        sqlx::query("UPDATE runs SET status = $2 WHERE id = $1")
            .bind(run_id.to_string())
            .bind(to.as_str())
            .execute(&mut *tx)
            .await?;

        OutboxStore::append_in_tx(&mut tx, tables::RUNS, Action::Update, &run).await?;
        tx.commit().await?;

        Ok(run)
    }
}

#[async_trait]
impl RunService for RunStore {
    async fn list_runs(&self, opts: ListRunsOptions) -> ServiceResult<Page<Run>> {
        let excluded: Vec<String> = if opts.incomplete_only {
            DONE_STATUSES.iter().map(|s| s.as_str().to_string()).collect()
        } else {
            Vec::new()
        };

        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM runs
            WHERE status <> ALL($1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(&excluded)
            .bind(i64::from(opts.page.limit()))
            .bind(opts.page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM runs WHERE status <> ALL($1)")
            .bind(&excluded)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let items = rows.into_iter().map(|row| row.0).collect();
        Ok(Page::new(items, opts.page, total.max(0) as u64))
    }

    fn watch_runs(&self) -> Subscription<Run> {
        self.broker.subscribe()
    }

    #[instrument(skip(self))]
    async fn enqueue_plan(&self, run_id: RunId) -> ServiceResult<Run> {
        self.transition(
            run_id,
            RunStatus::PlanQueued,
            |status| status == RunStatus::Pending,
            "pending",
        )
        .await
    }
}
