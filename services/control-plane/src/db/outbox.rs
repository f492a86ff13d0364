//! Outbox table access.
//!
//! Write paths record a change notification with [`OutboxStore::append_in_tx`]
//! inside the transaction that makes the change. The listener drains the table
//! with [`OutboxStore::claim_all`], which deletes and returns every queued row
//! in a single statement, so a row is claimed by exactly one caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tfrun_events::{Action, OutboxEvent};

use super::DbError;

struct OutboxRow(OutboxEvent);

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let action: String = row.try_get("action")?;
        let action = action
            .parse::<Action>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Self(OutboxEvent {
            id: row.try_get("id")?,
            table: row.try_get("table_name")?,
            action,
            payload: row.try_get("payload")?,
            created_at,
        }))
    }
}

/// Store for the change-notification outbox.
#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    /// Create a new outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically delete and return all queued outbox rows, oldest first.
    pub async fn claim_all(&self) -> Result<Vec<OutboxEvent>, DbError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            WITH claimed AS (
                DELETE FROM events_outbox
                RETURNING id, table_name, action, payload, created_at
            )
            SELECT id, table_name, action, payload, created_at
            FROM claimed
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    /// Record a change notification within an existing transaction.
    pub async fn append_in_tx<T: Serialize>(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        table: &str,
        action: Action,
        payload: &T,
    ) -> Result<(), DbError> {
        let payload = serde_json::to_value(payload)?;

        sqlx::query(
            r#"
            INSERT INTO events_outbox (table_name, action, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(table)
        .bind(action.as_str())
        .bind(payload)
        .execute(&mut **tx)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    /// Number of rows waiting to be claimed.
    pub async fn pending_count(&self) -> Result<i64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM events_outbox")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;

        row.try_get("count").map_err(DbError::Query)
    }
}
