//! In-process publish/subscribe hub, fanning out reload signals to every connected browser tab.
//!
//! Each [`Subscription`] owns an unbounded queue. Publishing never waits on a slow subscriber.
//! Subscriptions remove themselves from the hub when dropped, on whatever path they end.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures_util::Stream;
use tracing::trace;

/// The single event type of the hub. It carries no payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reload;

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, flume::Sender<Reload>>>,
}

impl Hub {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, flume::Sender<Reload>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply cloneable handle to the hub.
#[derive(Clone, Default)]
pub struct Broadcaster {
    hub: Arc<Hub>,
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a reload event to every currently registered subscriber, returning how many
    /// received it.
    pub fn publish(&self) -> usize {
        let snapshot = self.hub.subscribers().values().cloned().collect::<Vec<_>>();

        let delivered = snapshot
            .iter()
            .filter(|tx| tx.send(Reload).is_ok())
            .count();

        trace!(delivered, subscribers = snapshot.len(), "published reload");
        delivered
    }

    /// Register a new subscriber. It receives every event published from now on, until it is
    /// dropped.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();

        self.hub.subscribers().insert(id, tx);
        trace!(id, "registered subscriber");

        Subscription {
            id,
            receiver: rx,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscribers().len()
    }
}

/// A live listener on the [`Broadcaster`].
pub struct Subscription {
    id: u64,
    receiver: flume::Receiver<Reload>,
    hub: Arc<Hub>,
}

impl Subscription {
    /// Wait for the next reload event.
    ///
    /// The hub keeps the sending half alive for as long as the subscription exists, so this only
    /// ever returns `None` if the queue was torn down from the outside.
    pub async fn recv(&mut self) -> Option<Reload> {
        self.receiver.recv_async().await.ok()
    }

    /// Take an already queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<Reload> {
        self.receiver.try_recv().ok()
    }

    /// Turn the subscription into an endless stream of events. The subscription stays registered
    /// until the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Reload> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers().remove(&self.id);
        trace!(id = self.id, "removed subscriber");
    }
}
