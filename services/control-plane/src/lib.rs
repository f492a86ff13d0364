//! tfrun control plane library.
//!
//! The scheduler core of the control plane: per-workspace run queues fed by
//! change notifications from the outbox table. The crate ships a
//! `control-plane` binary; the library surface exists for integration
//! testing and reuse.

pub mod backoff;
pub mod config;
pub mod db;
pub mod pubsub;
pub mod run;
pub mod scheduler;
pub mod service;
pub mod workspace;
