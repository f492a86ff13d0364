//! Outbox listener.
//!
//! Polls the outbox, claiming (deleting) every queued row in one statement,
//! and dispatches each row to the callback registered for its table. A row is
//! delivered to at most one listener: when several processes listen against
//! the same database, whichever claims a row first receives it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tfrun_events::{Action, OutboxEvent};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::db::{DbError, OutboxStore};

/// Callback invoked with the action and raw JSON payload of an outbox row.
pub type TableCallback = Arc<dyn Fn(Action, serde_json::Value) + Send + Sync>;

/// Source of claimed outbox rows.
#[async_trait]
pub trait OutboxSource: Send + Sync {
    /// Remove and return every queued row, oldest first.
    async fn claim_all(&self) -> Result<Vec<OutboxEvent>, DbError>;
}

#[async_trait]
impl OutboxSource for OutboxStore {
    async fn claim_all(&self) -> Result<Vec<OutboxEvent>, DbError> {
        OutboxStore::claim_all(self).await
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to claim outbox rows: {0}")]
    Database(#[from] DbError),
}

/// Configuration for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Pause between polls.
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Listener<S> {
    source: S,
    config: ListenerConfig,
    tables: RwLock<HashMap<String, TableCallback>>,
}

impl<S: OutboxSource> Listener<S> {
    pub fn new(source: S, config: ListenerConfig) -> Self {
        Self {
            source,
            config,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Route rows for `table` to `callback`, replacing any earlier callback.
    pub fn register_table(&self, table: impl Into<String>, callback: TableCallback) {
        let table = table.into();
        debug!(table = %table, "Registered outbox table");
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, callback);
    }

    fn callback(&self, table: &str) -> Option<TableCallback> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    /// Poll until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "outbox_listener")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ListenerError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting outbox listener"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping outbox listener");
                return Ok(());
            }

            let rows = self.source.claim_all().await?;
            if !rows.is_empty() {
                debug!(count = rows.len(), "Dispatching outbox rows");
            }

            for row in rows {
                match self.callback(&row.table) {
                    Some(callback) => callback(row.action, row.payload),
                    None => warn!(
                        outbox_id = row.id,
                        table = %row.table,
                        action = %row.action,
                        "No callback registered for outbox table, dropping row"
                    ),
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping outbox listener");
                        return Ok(());
                    }
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }
}
