//! A watcher fans the output of one [Source](crate::source::Source) out to
//! every subscription for the same target.

use crate::endpoint::Snapshot;
#[cfg(feature = "probes")]
use crate::probes;
use crate::source::Updates;
use crate::subscription::Subscription;
use crate::target::Key;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

/// The lifecycle of a watcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// The watcher exists, but is not yet consuming its source.
    Created,

    /// The watcher is delivering snapshots from its source.
    ///
    /// - (On source closing, or shutdown) State becomes Closed
    Running,

    /// Final state. Every subscription has been closed, and no more will be
    /// accepted.
    Closed,
}

#[derive(Error, Debug)]
#[error("Watcher has closed")]
pub struct Closed;

struct Inner {
    state: State,

    // The most recently delivered snapshot, or "None" before the source has
    // produced anything.
    last: Option<Snapshot>,

    // Must only be modified while "last" is also held, so that joining
    // subscribers see each snapshot exactly once.
    subscriptions: Vec<Arc<Subscription>>,
}

impl Drop for Inner {
    // Reached without "close" only if the watcher task was aborted.
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            subscription.close();
        }
    }
}

/// A broadcast hub for one target.
///
/// Clones refer to the same watcher.
#[derive(Clone)]
pub(crate) struct Watcher {
    key: Key,
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<State>>,
}

impl Watcher {
    /// Creates a watcher with its first subscription already registered.
    pub(crate) fn new(key: Key, first: Arc<Subscription>) -> Self {
        let (state_tx, _) = watch::channel(State::Created);
        Self {
            key,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Created,
                last: None,
                subscriptions: vec![first],
            })),
            state_tx: Arc::new(state_tx),
        }
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    /// Returns true if both handles refer to the same watcher.
    pub(crate) fn same_as(&self, other: &Watcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tracks the lifecycle of this watcher.
    pub(crate) fn monitor(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    pub(crate) async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    /// Registers a subscription.
    ///
    /// If a snapshot has already been delivered, the subscription receives
    /// it as its first message. Otherwise it receives the next snapshot
    /// delivered. This happens under the same lock as delivery, so the
    /// subscriber never sees a snapshot twice, and never misses one.
    #[instrument(skip_all, fields(key = %self.key, id = ?subscription.id()), name = "Watcher::join")]
    pub(crate) async fn join(&self, subscription: Arc<Subscription>) -> Result<(), Closed> {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Closed {
            event!(Level::DEBUG, "Refusing to join closed watcher");
            return Err(Closed);
        }
        if let Some(last) = &inner.last {
            if !subscription.preload(last.clone()) {
                event!(Level::WARN, "New subscription could not take last snapshot");
            }
        }
        inner.subscriptions.push(subscription);
        Ok(())
    }

    /// Consumes `updates` until it closes or `shutdown` is cancelled, then
    /// closes every subscription.
    #[instrument(skip_all, fields(key = %self.key), name = "Watcher::run")]
    pub(crate) async fn run(&self, mut updates: Updates, shutdown: CancellationToken) {
        self.inner.lock().await.state = State::Running;
        self.state_tx.send_replace(State::Running);
        #[cfg(feature = "probes")]
        probes::watcher__start!(|| self.key.as_str());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    event!(Level::INFO, "Shutting down watcher");
                    break;
                }
                update = updates.recv() => {
                    let Some(snapshot) = update else {
                        event!(Level::ERROR, "Unable to read updates from endpoint source");
                        break;
                    };
                    self.broadcast(snapshot, &shutdown).await;
                }
            }
        }

        // Dropping the receiver tells the source to stop, if it hasn't
        // already.
        drop(updates);
        self.close().await;
    }

    // Records "snapshot" as the latest, and hands it to every subscription
    // which is still live. Finished subscriptions are closed and pruned.
    //
    // Deliveries happen one at a time with the lock held. A subscriber which
    // isn't reading stalls this pass, and every other subscriber, until it
    // goes away or shutdown is requested.
    async fn broadcast(&self, snapshot: Snapshot, shutdown: &CancellationToken) {
        let mut inner = self.inner.lock().await;
        inner.last = Some(snapshot.clone());

        let subscriptions = std::mem::take(&mut inner.subscriptions);
        let starting = subscriptions.len();
        #[cfg(feature = "probes")]
        probes::broadcast__start!(|| (self.key.as_str(), starting as u64));

        let mut alive = Vec::with_capacity(starting);
        let mut delivered = 0;
        let mut remaining = subscriptions.into_iter();
        while let Some(subscription) = remaining.next() {
            let Some(tx) = subscription.sender() else {
                subscription.close();
                continue;
            };
            tokio::select! {
                result = tx.send(snapshot.clone()) => {
                    if result.is_ok() {
                        delivered += 1;
                        alive.push(subscription);
                    } else {
                        event!(
                            Level::DEBUG,
                            id = ?subscription.id(),
                            "Subscriber went away during delivery"
                        );
                        subscription.close();
                    }
                }
                _ = shutdown.cancelled() => {
                    // Abandon the rest of this pass; "close" will take care
                    // of everyone.
                    alive.push(subscription);
                    alive.extend(remaining.by_ref());
                    break;
                }
            }
        }
        let pruned = starting - alive.len();
        inner.subscriptions = alive;
        drop(inner);

        #[cfg(feature = "probes")]
        probes::broadcast__done!(|| (self.key.as_str(), delivered as u64, pruned as u64));
        if pruned > 0 {
            event!(Level::INFO, pruned, "Pruned finished subscriptions");
        }
        event!(Level::DEBUG, delivered, entries = snapshot.len(), "Delivered snapshot");
    }

    // Transitions to "Closed", closing every subscription's channel exactly
    // once, whether or not it has finished.
    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = State::Closed;
        event!(
            Level::INFO,
            count = inner.subscriptions.len(),
            "Closing subscription channels"
        );
        for subscription in inner.subscriptions.drain(..) {
            subscription.close();
        }
        drop(inner);
        self.state_tx.send_replace(State::Closed);
        #[cfg(feature = "probes")]
        probes::watcher__closed!(|| self.key.as_str());
    }
}
