//! Outbox rows: persisted change notifications awaiting delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Action;

/// Table names used as outbox routing keys.
pub mod tables {
    pub const WORKSPACES: &str = "workspaces";
    pub const RUNS: &str = "runs";
}

/// A change recorded in the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic outbox sequence; claimed rows are delivered in this order.
    pub id: i64,

    /// Name of the table the change was made to.
    pub table: String,

    /// Kind of change.
    pub action: Action,

    /// The changed resource, serialized as JSON.
    pub payload: serde_json::Value,

    /// When the change was recorded.
    pub created_at: DateTime<Utc>,
}
