//! Session-level Postgres advisory locks.
//!
//! A cluster singleton (such as the scheduler) holds its lock on a dedicated
//! connection for as long as it runs. The lock is bound to the session, so it
//! must be released on the same connection that acquired it; if the holder
//! goes away without releasing, the connection is closed and Postgres frees
//! the lock with the session.

use std::time::Duration;

use sqlx::{pool::PoolConnection, postgres::PgPool, Postgres, Row};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::DbError;

/// Advisory lock ID guaranteeing only one scheduler runs in a cluster.
pub const SCHEDULER_LOCK_ID: i64 = 5577006791947779410;

/// A held advisory lock.
pub struct AdvisoryLock {
    id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl AdvisoryLock {
    /// Wait until the lock with the given ID is obtained.
    ///
    /// Polls with `pg_try_advisory_lock` every `retry_interval`. Returns
    /// `Ok(None)` if shutdown is signaled before the lock is obtained.
    pub async fn acquire(
        pool: &PgPool,
        id: i64,
        retry_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Option<Self>, DbError> {
        let mut conn = pool.acquire().await.map_err(DbError::Query)?;

        loop {
            let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
                .bind(id)
                .fetch_one(&mut *conn)
                .await
                .map_err(DbError::Query)?;
            let locked: bool = row.try_get("locked").map_err(DbError::Query)?;

            if locked {
                debug!(lock_id = id, "Acquired advisory lock");
                return Ok(Some(Self {
                    id,
                    conn: Some(conn),
                }));
            }

            debug!(lock_id = id, "Advisory lock held elsewhere, waiting");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    /// The lock's ID.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Release the lock and return its connection to the pool.
    pub async fn release(mut self) -> Result<(), DbError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let result = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.id)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {
                debug!(lock_id = self.id, "Released advisory lock");
                Ok(())
            }
            Err(e) => {
                // Never hand a connection that may still hold the lock back to the pool.
                drop(conn.detach());
                Err(DbError::Query(e))
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                lock_id = self.id,
                "Advisory lock dropped without release; closing its connection"
            );
            drop(conn.detach());
        }
    }
}
