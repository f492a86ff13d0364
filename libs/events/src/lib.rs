//! # tfrun-events
//!
//! Change-notification types shared by the outbox writers, the listener and
//! the in-process broker.
//!
//! ## Flow
//!
//! - A write path records an [`OutboxEvent`] in the same transaction as the
//!   change it describes (`table`, [`Action`], JSON payload).
//! - The listener claims outbox rows and hands `(action, payload)` to the
//!   callback registered for the row's table.
//! - The broker decodes the payload and fans out a typed [`Event`] to its
//!   subscribers.

mod error;
mod outbox;
mod types;

pub use error::EventError;
pub use outbox::*;
pub use types::*;
