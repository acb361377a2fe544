//! One subscriber's delivery path from a watcher.

use crate::endpoint::Snapshot;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Uniquely identifies a subscription
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct State {
    // "None" once the channel has been closed.
    tx: Option<mpsc::Sender<Snapshot>>,
    finished: bool,
}

/// The watcher's side of one subscriber.
///
/// The watcher holds this to deliver snapshots, and the subscriber holds it
/// to report that it is done. The "finished" flag and the channel are guarded
/// by a lock belonging to this subscription alone, so finishing never waits
/// on the watcher.
pub(crate) struct Subscription {
    id: SubscriptionId,
    state: Mutex<State>,
}

impl Subscription {
    /// Creates a subscription, returning the receiving end of its channel.
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<Snapshot>) {
        // Deliveries are a handoff: a capacity of one is the least tokio
        // allows, so a slow subscriber stalls its watcher after one message.
        let (tx, rx) = mpsc::channel(1);
        let subscription = Arc::new(Self {
            id: SubscriptionId::new(),
            state: Mutex::new(State {
                tx: Some(tx),
                finished: false,
            }),
        });
        (subscription, rx)
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Marks that the subscriber no longer wants updates.
    ///
    /// The watcher closes the channel on its next pass.
    pub(crate) fn finish(&self) {
        self.state.lock().unwrap().finished = true;
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// Returns a sender for delivery, or `None` if the subscription is
    /// finished or already closed.
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Snapshot>> {
        let state = self.state.lock().unwrap();
        if state.finished {
            return None;
        }
        state.tx.clone()
    }

    /// Queues `snapshot` as the first message of a subscription which has
    /// never been delivered to.
    ///
    /// Returns false if there was no room, which only happens if something
    /// was already delivered.
    pub(crate) fn preload(&self, snapshot: Snapshot) -> bool {
        let state = self.state.lock().unwrap();
        match &state.tx {
            Some(tx) => tx.try_send(snapshot).is_ok(),
            None => false,
        }
    }

    /// Closes the channel. Later calls do nothing.
    ///
    /// The receiver observes the close once any in-flight delivery holding a
    /// cloned sender completes.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().tx.take();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().tx.is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = Subscription::new();
        let (b, _rx_b) = Subscription::new();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn finished_subscriptions_have_no_sender() {
        let (sub, _rx) = Subscription::new();
        assert!(sub.sender().is_some());
        sub.finish();
        assert!(sub.is_finished());
        assert!(sub.sender().is_none());
    }

    #[tokio::test]
    async fn close_is_observed_by_receiver() {
        let (sub, mut rx) = Subscription::new();
        sub.close();
        sub.close();
        assert!(sub.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn preload_fills_the_only_slot() {
        let (sub, mut rx) = Subscription::new();
        let snapshot = Snapshot::new([Endpoint::new("test", 50051, 1)]);
        assert!(sub.preload(snapshot.clone()));
        assert!(!sub.preload(snapshot.clone()));
        assert_eq!(rx.recv().await, Some(snapshot));
    }
}
