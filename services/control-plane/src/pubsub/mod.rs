//! Change notification: outbox listener and in-process typed fan-out.
//!
//! The [`Listener`] drains the outbox table and hands each row to the callback
//! registered for its table. A [`Broker`] is usually that callback: it decodes
//! the row into a typed [`Event`](tfrun_events::Event) and delivers it to every
//! [`Subscription`].

mod broker;
mod listener;

pub use broker::{Broker, Subscription, SUBSCRIBER_BUFFER};
pub use listener::{Listener, ListenerConfig, ListenerError, OutboxSource, TableCallback};
