//! The interface for sources, which find the endpoints of a target.

use crate::endpoint::Snapshot;
use crate::target::Target;

use async_trait::async_trait;
use hickory_resolver::error::ResolveError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DNS resolution failed")]
    Resolve(#[from] ResolveError),

    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// A live sequence of snapshots for one target.
///
/// The sequence ends (`recv` returns `None`) when the source stops, either
/// because a lookup failed or because shutdown was requested.
pub type Updates = mpsc::Receiver<Snapshot>;

/// Translates a target into a live sequence of [Snapshot]s.
///
/// A source knows nothing about subscribers; it is driven by exactly one
/// watcher, which fans its output out.
#[async_trait]
pub trait Source: Send + Sync {
    /// Starts watching `target`.
    ///
    /// Implementations must check that the target can be resolved before
    /// returning, and must not start any background work if it cannot.
    /// Background work stops once `shutdown` is cancelled, or once the
    /// returned receiver is dropped.
    async fn open(&self, target: &Target, shutdown: CancellationToken) -> Result<Updates, Error>;
}

/// Helper type for anything that implements the Source interface.
pub type SharedSource = Arc<dyn Source>;
