//! srvwatch streams the live membership of backend pools to many subscribers.
//!
//! It uses the following terminology:
//! * A target names a backend pool, e.g. a DNS SRV name.
//! * An endpoint is one reachable instance in that pool: a hostname, port and
//!   weight. A snapshot is the complete, canonically ordered set of endpoints
//!   for a target at one moment.
//! * A source turns a target into a live sequence of snapshots, reporting
//!   each change exactly once.
//!
//! # Usage
//!
//! * The main interface for this crate is [registry::Registry].
//! * To construct a registry, you must supply a [source::Source], which
//!   specifies "how to find endpoints". [sources::dns::DnsSource] polls DNS
//!   SRV records; [sources::fixed::FixedSource] reports a static set.
//! * Each call to [registry::Registry::subscribe] returns a
//!   [registry::WatchStream]. Subscriptions to the same target share a single
//!   watcher, and with it a single source: no matter how many subscribers
//!   there are, each target is only resolved once per period.
//!
//! # DTrace probes
//!
//! srvwatch contains a number of DTrace USDT probes, which fire as targets are
//! resolved and snapshots are fanned out. The full list of probes is:
//!
//! - `subscribe-start`: Fires when a subscription to a target is requested.
//! - `subscribe-done`: Fires when a subscription has been registered.
//! - `subscribe-failed`: Fires when a subscription could not be registered.
//! - `subscription-finished`: Fires when a subscriber goes away.
//! - `watcher-start`: Fires when a watcher starts consuming its source.
//! - `watcher-closed`: Fires when a watcher has closed every subscription.
//! - `broadcast-start`: Fires before a snapshot is fanned out.
//! - `broadcast-done`: Fires after a snapshot has been fanned out.
//! - `poll-start`: Fires before a source resolves a target.
//! - `poll-done`: Fires after a source has resolved a target.
//! - `poll-failed`: Fires when a source fails to resolve a target.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is technically fallible. To account for this, the
//! `registry::Registry::new` constructor returns a `Result` which gives access
//! to the registry in both the `Ok` and `Err` variant, so applications can
//! decide for themselves whether an uninstrumented registry is acceptable.
//! (This is similar to the `std::sync::PoisonError`.)

// Public API
pub mod endpoint;
pub mod health;
pub mod poll;
pub mod registry;
pub mod source;
pub mod target;
pub mod watcher;

// Necessary for implementation
mod join;
mod subscription;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod sources;

/// USDT probes for tracing how srvwatch resolves targets and fans out
/// snapshots.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "srvwatch")]
mod probes {
    /// Fires right before registering a subscription to a target.
    fn subscribe__start(key: &str, subscription_id: u64) {}

    /// Fires when a subscription has been registered with a watcher.
    fn subscribe__done(key: &str, subscription_id: u64) {}

    /// Fires when a subscription could not be registered, with a string
    /// identifying the reason.
    fn subscribe__failed(key: &str, reason: &str) {}

    /// Fires when a subscriber is dropped. Its watcher stops delivering to it
    /// on the next snapshot.
    fn subscription__finished(key: &str, subscription_id: u64) {}

    /// Fires when a watcher starts consuming updates from its source.
    fn watcher__start(key: &str) {}

    /// Fires when a watcher has closed, along with every subscription it held.
    fn watcher__closed(key: &str) {}

    /// Fires before a snapshot is delivered, with the number of subscriptions
    /// held by the watcher.
    fn broadcast__start(key: &str, subscriptions: u64) {}

    /// Fires after a snapshot has been delivered, with the number of
    /// subscriptions which received it and the number which were pruned.
    fn broadcast__done(key: &str, delivered: u64, pruned: u64) {}

    /// Fires right before a polling source resolves its target.
    fn poll__start(name: &str) {}

    /// Fires after a polling source resolves its target, with the number of
    /// endpoints found.
    fn poll__done(name: &str, endpoints: u64) {}

    /// Fires when a polling source fails to resolve its target. The source
    /// stops after this.
    fn poll__failed(name: &str, reason: &str) {}
}
