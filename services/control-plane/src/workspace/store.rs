//! Postgres-backed workspace service.
//!
//! Every change is written together with its outbox row in one transaction,
//! so listeners observe exactly the committed state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tfrun_events::{tables, Action};
use tfrun_id::{RunId, UserId, WorkspaceId};
use tracing::{debug, instrument};

use super::{Lock, LockHolder, Workspace, WorkspaceService};
use crate::db::OutboxStore;
use crate::pubsub::{Broker, Subscription};
use crate::service::{Page, PageOptions, ServiceError, ServiceResult};

const SELECT_COLUMNS: &str = r#"
    id, name, organization, lock_kind, lock_holder, latest_run_id, created_at, updated_at
"#;

struct WorkspaceRow(Workspace);

fn decode_err(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

impl<'r> sqlx::FromRow<'r, PgRow> for WorkspaceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let lock_kind: Option<String> = row.try_get("lock_kind")?;
        let lock_holder: Option<String> = row.try_get("lock_holder")?;
        let latest_run_id: Option<String> = row.try_get("latest_run_id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        let lock = match (lock_kind.as_deref(), lock_holder) {
            (Some("user"), Some(holder)) => {
                Lock::held_by(LockHolder::User(holder.parse::<UserId>().map_err(decode_err)?))
            }
            (Some("run"), Some(holder)) => {
                Lock::held_by(LockHolder::Run(holder.parse::<RunId>().map_err(decode_err)?))
            }
            _ => Lock::default(),
        };

        Ok(Self(Workspace {
            id: id.parse().map_err(decode_err)?,
            name: row.try_get("name")?,
            organization: row.try_get("organization")?,
            lock,
            latest_run_id: latest_run_id
                .map(|s| s.parse())
                .transpose()
                .map_err(decode_err)?,
            created_at,
            updated_at,
        }))
    }
}

/// Workspace service over the `workspaces` table.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: PgPool,
    broker: Broker<Workspace>,
}

impl WorkspaceStore {
    /// `broker` must be the broker the listener feeds with `workspaces` rows.
    pub fn new(pool: PgPool, broker: Broker<Workspace>) -> Self {
        Self { pool, broker }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, organization: &str, name: &str) -> ServiceResult<Workspace> {
        let ws = Workspace::new(organization, name);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, organization, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(ws.id.to_string())
        .bind(&ws.name)
        .bind(&ws.organization)
        .bind(ws.created_at)
        .bind(ws.updated_at)
        .execute(&mut *tx)
        .await?;

        OutboxStore::append_in_tx(&mut tx, tables::WORKSPACES, Action::Insert, &ws).await?;
        tx.commit().await?;

        debug!(workspace_id = %ws.id, "Created workspace");
        Ok(ws)
    }

    pub async fn get(&self, workspace_id: WorkspaceId) -> ServiceResult<Workspace> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM workspaces WHERE id = $1");
        sqlx::query_as::<_, WorkspaceRow>(&sql)
            .bind(workspace_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.0)
            .ok_or_else(|| ServiceError::not_found("workspace", workspace_id))
    }

    /// Delete a workspace; its runs go with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, workspace_id: WorkspaceId) -> ServiceResult<Workspace> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("DELETE FROM workspaces WHERE id = $1 RETURNING {SELECT_COLUMNS}");
        let ws = sqlx::query_as::<_, WorkspaceRow>(&sql)
            .bind(workspace_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.0)
            .ok_or_else(|| ServiceError::not_found("workspace", workspace_id))?;

        OutboxStore::append_in_tx(&mut tx, tables::WORKSPACES, Action::Delete, &ws).await?;
        tx.commit().await?;

        Ok(ws)
    }

    /// Apply `change` to the row under `SELECT ... FOR UPDATE` and persist it.
    async fn update<F>(&self, workspace_id: WorkspaceId, change: F) -> ServiceResult<Workspace>
    where
        F: FnOnce(&mut Workspace) -> ServiceResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {SELECT_COLUMNS} FROM workspaces WHERE id = $1 FOR UPDATE");
        let mut ws = sqlx::query_as::<_, WorkspaceRow>(&sql)
            .bind(workspace_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.0)
            .ok_or_else(|| ServiceError::not_found("workspace", workspace_id))?;

        change(&mut ws)?;
        ws.updated_at = Utc::now();

        let holder = ws.lock.holder();
        sqlx::query(
            r#"
            UPDATE workspaces
            SET lock_kind = $2, lock_holder = $3, latest_run_id = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(ws.id.to_string())
        .bind(holder.map(|h| h.kind().as_str()))
        .bind(holder.map(|h| h.to_string()))
        .bind(ws.latest_run_id.map(|id| id.to_string()))
        .bind(ws.updated_at)
        .execute(&mut *tx)
        .await?;

        OutboxStore::append_in_tx(&mut tx, tables::WORKSPACES, Action::Update, &ws).await?;
        tx.commit().await?;

        Ok(ws)
    }
}

#[async_trait]
impl WorkspaceService for WorkspaceStore {
    async fn list_workspaces(&self, opts: PageOptions) -> ServiceResult<Page<Workspace>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM workspaces ORDER BY created_at, id LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query_as::<_, WorkspaceRow>(&sql)
            .bind(i64::from(opts.limit()))
            .bind(opts.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM workspaces")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let items = rows.into_iter().map(|row| row.0).collect();
        Ok(Page::new(items, opts, total.max(0) as u64))
    }

    fn watch_workspaces(&self) -> Subscription<Workspace> {
        self.broker.subscribe()
    }

    #[instrument(skip(self, holder), fields(holder = %holder))]
    async fn lock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
    ) -> ServiceResult<Workspace> {
        self.update(workspace_id, |ws| Ok(ws.lock.lock(holder)?))
            .await
    }

    #[instrument(skip(self, holder), fields(holder = %holder))]
    async fn unlock_workspace(
        &self,
        workspace_id: WorkspaceId,
        holder: LockHolder,
        force: bool,
    ) -> ServiceResult<Workspace> {
        self.update(workspace_id, |ws| Ok(ws.lock.unlock(holder, force)?))
            .await
    }

    #[instrument(skip(self))]
    async fn set_current_run(
        &self,
        workspace_id: WorkspaceId,
        run_id: RunId,
    ) -> ServiceResult<Workspace> {
        self.update(workspace_id, |ws| {
            ws.latest_run_id = Some(run_id);
            Ok(())
        })
        .await
    }
}
