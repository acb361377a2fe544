//! The registry maps targets to [watchers](crate::watcher), and implements the
//! streaming subscribe operation on top of them.

use crate::endpoint::Snapshot;
use crate::join;
#[cfg(feature = "probes")]
use crate::probes;
use crate::source::{self, SharedSource};
use crate::subscription::Subscription;
pub use crate::subscription::SubscriptionId;
use crate::target::{Key, Target};
use crate::watcher::{self, Watcher};

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

/// Why a subscription ended.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to initialize endpoint source")]
    InvalidTarget(#[source] source::Error),

    #[error("Endpoint source closed unexpectedly")]
    UpstreamClosed,

    #[error("Client disconnected")]
    Cancelled,

    #[error("Server shutting down")]
    Unavailable,
}

/// Status codes for reporting an [Error] over an RPC transport.
///
/// These match the gRPC codes of the same names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    Internal,
    Cancelled,
    Unavailable,
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidTarget(_) => Code::InvalidArgument,
            Error::UpstreamClosed => Code::Internal,
            Error::Cancelled => Code::Cancelled,
            Error::Unavailable => Code::Unavailable,
        }
    }

    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::InvalidTarget(_) => "InvalidTarget",
            Error::UpstreamClosed => "UpstreamClosed",
            Error::Cancelled => "Cancelled",
            Error::Unavailable => "Unavailable",
        }
    }
}

/// The caller's end of a subscription, as seen by the transport.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Forwards a snapshot to the caller.
    ///
    /// An error means the caller can no longer be reached.
    async fn send(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed>;

    /// Completes once the caller has gone away.
    async fn closed(&self);
}

/// The caller of a [SnapshotSink] can no longer be reached.
#[derive(Error, Debug)]
#[error("Client stream closed")]
pub struct SinkClosed;

#[async_trait]
impl SnapshotSink for mpsc::Sender<Snapshot> {
    async fn send(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, snapshot)
            .await
            .map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

type Watchers = Arc<Mutex<HashMap<Key, Watcher>>>;

/// Tracks one watcher for each watched target.
///
/// Watchers are created on the first subscription to a target and shared by
/// every later subscription to it. A watcher stays registered, even without
/// subscribers, until its source stops; it is then removed, and the next
/// subscription to its target creates a fresh one.
///
/// Dropping the registry aborts every watcher, ending their subscriptions
/// with [Error::UpstreamClosed]. Use [Registry::terminate] for an orderly
/// shutdown.
pub struct Registry {
    source: SharedSource,
    shutdown: CancellationToken,
    watchers: Watchers,
    tasks: std::sync::Mutex<JoinSet<()>>,
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However, similar
/// to `std::sync::PoisonError`, this contains the registry itself.
pub struct RegistrationError(Registry);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained registry.
    pub fn into_inner(self) -> Registry {
        self.0
    }
}

impl Registry {
    /// Creates a new, empty registry.
    ///
    /// - source: Describes how the endpoints of a target should be found.
    /// - shutdown: Cancelling this stops every watcher and ends every
    ///   subscription with [Error::Unavailable].
    ///
    /// ```no_run
    /// use srvwatch::registry::Registry;
    /// use srvwatch::sources::dns::{DnsSource, DnsSourceConfig};
    /// use srvwatch::target::Target;
    /// use std::sync::Arc;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async {
    /// let source = Arc::new(DnsSource::new(DnsSourceConfig::default()).unwrap());
    /// let shutdown = CancellationToken::new();
    /// let registry = Registry::new(source, shutdown.clone()).unwrap();
    ///
    /// // Stream updates to a channel until the server shuts down.
    /// let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    /// let mut sink = tx;
    /// let target = Target::srv("grpc", "tcp", "example.com");
    /// tokio::spawn(async move {
    ///     let reason = registry.watch(&target, &mut sink).await;
    ///     eprintln!("stream ended: {reason}");
    /// });
    /// while let Some(snapshot) = rx.recv().await {
    ///     println!("{snapshot:?}");
    /// }
    /// # };
    /// ```
    ///
    /// # DTrace probe registration
    ///
    /// This constructor returns a `Result`, because it attempts to register
    /// the USDT probes it exposes. The `Err` variant still gives access to
    /// the registry, so callers may choose whether a registration failure is
    /// fatal.
    pub fn new(source: SharedSource, shutdown: CancellationToken) -> Result<Self, RegistrationError> {
        let self_ = Self {
            source,
            shutdown,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            tasks: std::sync::Mutex::new(JoinSet::new()),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Subscribes to the endpoints of `target`.
    ///
    /// The first subscription to a target validates it with one lookup, and
    /// fails with [Error::InvalidTarget] if that lookup fails. Later
    /// subscriptions to the same target share its watcher, and receive the
    /// most recent snapshot as their first message.
    #[instrument(skip(self), name = "Registry::subscribe")]
    pub async fn subscribe(&self, target: &Target) -> Result<WatchStream, Error> {
        let key = target.key();
        if self.shutdown.is_cancelled() {
            event!(Level::INFO, %key, "Refusing subscription during shutdown");
            return Err(Error::Unavailable);
        }
        let (subscription, rx) = Subscription::new();
        #[cfg(feature = "probes")]
        probes::subscribe__start!(|| (key.as_str(), subscription.id().0));
        event!(Level::INFO, %key, "Client connected");

        let result = self.register(target, &key, subscription.clone()).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(()) => probes::subscribe__done!(|| (key.as_str(), subscription.id().0)),
            Err(err) => probes::subscribe__failed!(|| (key.as_str(), err.as_str())),
        }
        result?;

        Ok(WatchStream {
            key,
            subscription,
            rx,
            shutdown: self.shutdown.clone(),
        })
    }

    // Finds or creates the watcher for "key", and registers "subscription"
    // with it.
    //
    // The registry lock is held throughout, including across the validating
    // lookup of a new target, so two subscriptions can never create two
    // watchers for the same key.
    async fn register(
        &self,
        target: &Target,
        key: &Key,
        subscription: Arc<Subscription>,
    ) -> Result<(), Error> {
        let mut watchers = self.watchers.lock().await;

        if let Some(watcher) = watchers.get(key).cloned() {
            match watcher.join(subscription.clone()).await {
                Ok(()) => return Ok(()),
                // The watcher closed, but hasn't evicted itself yet.
                Err(watcher::Closed) => {
                    event!(Level::INFO, %key, "Replacing closed watcher");
                    watchers.remove(key);
                }
            }
        }

        let updates = self
            .source
            .open(target, self.shutdown.clone())
            .await
            .map_err(|err| {
                event!(Level::WARN, %key, ?err, "Unable to initialize endpoint source");
                Error::InvalidTarget(err)
            })?;

        // The new watcher starts with our subscription, so it is registered
        // before the watcher can deliver anything.
        let watcher = Watcher::new(key.clone(), subscription);
        watchers.insert(key.clone(), watcher.clone());
        self.spawn_watcher(watcher, updates);
        Ok(())
    }

    fn spawn_watcher(&self, watcher: Watcher, updates: source::Updates) {
        let shutdown = self.shutdown.clone();
        let watchers = Arc::downgrade(&self.watchers);
        let mut tasks = self.tasks.lock().unwrap();

        // Reap watchers which have already exited.
        join::reap_finished(&mut tasks);

        tasks.spawn(async move {
            watcher.run(updates, shutdown).await;
            evict(watchers, &watcher).await;
        });
    }

    /// Subscribes to `target`, and forwards every snapshot to `sink` until
    /// the subscription ends.
    ///
    /// Returns the reason the subscription ended. This is never a success:
    /// a live subscription only ends when something goes away.
    pub async fn watch<S: SnapshotSink>(&self, target: &Target, sink: &mut S) -> Error {
        match self.subscribe(target).await {
            Ok(stream) => stream.forward(sink).await,
            Err(err) => err,
        }
    }

    /// Returns true if a watcher is currently registered for `key`.
    pub async fn watching(&self, key: &Key) -> bool {
        self.watchers.lock().await.contains_key(key)
    }

    /// Returns the number of registered watchers.
    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the number of subscriptions held by the watcher for `key`,
    /// including finished ones which have not been pruned yet.
    pub async fn subscriptions(&self, key: &Key) -> Option<usize> {
        let watcher = self.watchers.lock().await.get(key).cloned()?;
        Some(watcher.subscription_count().await)
    }

    /// Tracks the lifecycle of the watcher for `key`, if one is registered.
    pub async fn monitor(&self, key: &Key) -> Option<tokio::sync::watch::Receiver<watcher::State>> {
        self.watchers.lock().await.get(key).map(Watcher::monitor)
    }

    /// Requests shutdown, and waits for every watcher to stop.
    #[instrument(skip(self), name = "Registry::terminate")]
    pub async fn terminate(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        join::join_all(tasks).await;
    }
}

// Removes "watcher" from the registry, unless it has already been replaced.
async fn evict(watchers: Weak<Mutex<HashMap<Key, Watcher>>>, watcher: &Watcher) {
    let Some(watchers) = watchers.upgrade() else {
        return;
    };
    let mut watchers = watchers.lock().await;
    let key = watcher.key();
    if watchers.get(key).is_some_and(|w| w.same_as(watcher)) {
        event!(Level::INFO, %key, "Evicting closed watcher");
        watchers.remove(key);
    }
}

/// An open subscription to a target.
///
/// Dropping the stream marks the subscription finished; its watcher stops
/// delivering to it on the next update.
pub struct WatchStream {
    key: Key,
    subscription: Arc<Subscription>,
    rx: mpsc::Receiver<Snapshot>,
    shutdown: CancellationToken,
}

impl WatchStream {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Waits for the next snapshot.
    ///
    /// Fails with [Error::UpstreamClosed] once the watcher has closed, or
    /// [Error::Unavailable] once shutdown is requested.
    pub async fn next(&mut self) -> Result<Snapshot, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Unavailable);
        }
        tokio::select! {
            update = self.rx.recv() => match update {
                Some(snapshot) => Ok(snapshot),
                // Watchers also close their subscriptions on shutdown.
                None if self.shutdown.is_cancelled() => Err(Error::Unavailable),
                None => Err(Error::UpstreamClosed),
            },
            _ = self.shutdown.cancelled() => Err(Error::Unavailable),
        }
    }

    /// Forwards every snapshot to `sink` until the subscription ends, and
    /// returns the reason it ended.
    #[instrument(skip_all, fields(key = %self.key, id = ?self.id()), name = "WatchStream::forward")]
    pub async fn forward<S: SnapshotSink>(mut self, sink: &mut S) -> Error {
        let err = loop {
            let next = tokio::select! {
                next = self.next() => next,
                _ = sink.closed() => {
                    event!(Level::INFO, "Client disconnected cleanly");
                    break Error::Cancelled;
                }
            };
            let snapshot = match next {
                Ok(snapshot) => snapshot,
                Err(err) => break err,
            };
            // "send" holds the sink exclusively, so a peer which goes away
            // mid-send is reported by the send failing.
            tokio::select! {
                result = sink.send(snapshot) => {
                    if let Err(err) = result {
                        event!(Level::INFO, ?err, "Client disconnected");
                        break Error::Cancelled;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    event!(Level::INFO, "Shutdown while client was not reading");
                    break Error::Unavailable;
                }
            }
        };
        event!(Level::INFO, %err, "Subscription ended");
        err
    }

    /// Adapts this subscription into a stream, which yields the error that
    /// ended it as its final item.
    pub fn into_stream(self) -> impl Stream<Item = Result<Snapshot, Error>> + Send {
        futures::stream::unfold(Some(self), |stream| async move {
            let mut stream = stream?;
            match stream.next().await {
                Ok(snapshot) => Some((Ok(snapshot), Some(stream))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.subscription.finish();
        #[cfg(feature = "probes")]
        probes::subscription__finished!(|| (self.key.as_str(), self.subscription.id().0));
    }
}
