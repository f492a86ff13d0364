//! Typed in-process event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::de::DeserializeOwned;
use tfrun_events::{Action, Event};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use super::TableCallback;

/// Events buffered per subscriber before it is considered stuck.
pub const SUBSCRIBER_BUFFER: usize = 100;

struct BrokerInner<T> {
    name: String,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event<T>>>>,
}

impl<T> BrokerInner<T> {
    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Fans out events of one resource type to any number of subscribers.
///
/// Publishing never blocks. A subscriber that lets its buffer fill up is
/// dropped from the broker; its channel closes and its consumer sees the
/// subscription end.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Broker<T>
where
    T: Clone + Send + 'static,
{
    /// `name` identifies the broker in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.into(),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        debug!(broker = %self.inner.name, subscriber = id, "Subscribed");
        Subscription {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: Event<T>) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                error!(
                    broker = %self.inner.name,
                    subscriber = *id,
                    "Subscriber buffer full, unsubscribing"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// A listener callback that decodes outbox payloads and publishes them.
    pub fn table_callback(&self) -> TableCallback
    where
        T: DeserializeOwned + Sync,
    {
        let broker = self.clone();
        Arc::new(move |action: Action, payload: serde_json::Value| {
            match Event::<T>::from_outbox(action, payload) {
                Ok(event) => broker.publish(event),
                Err(e) => warn!(
                    broker = %broker.inner.name,
                    action = %action,
                    error = %e,
                    "Dropping undecodable outbox payload"
                ),
            }
        })
    }
}

/// Receiving end of a [`Broker`] subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<Event<T>>,
    broker: Weak<BrokerInner<T>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove(self.id);
        }
    }
}
