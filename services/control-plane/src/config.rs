use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;
use crate::pubsub::ListenerConfig;
use crate::scheduler::SchedulerWorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub listener: ListenerConfig,
    pub scheduler: SchedulerWorkerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("TFRUN_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("TFRUN_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let mut listener = ListenerConfig::default();
        if let Some(ms) = millis(&lookup, "TFRUN_LISTENER_POLL_INTERVAL_MS")? {
            listener.poll_interval = ms;
        }

        let mut scheduler = SchedulerWorkerConfig::default();
        if let Some(ms) = millis(&lookup, "TFRUN_SCHEDULER_LOCK_RETRY_MS")? {
            scheduler.lock_retry_interval = ms;
        }

        Ok(Self {
            log_level,
            dev_mode,
            database: DbConfig::from_lookup(&lookup),
            listener,
            scheduler,
        })
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{key} must be a number of milliseconds, got {v:?}"))
        })
        .transpose()
}
