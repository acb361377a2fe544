//! Serving-status reporting, in the shape of the gRPC health protocol.

use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{event, Level};

/// The name under which the endpoint-watching service reports its health.
pub const SERVICE_NAME: &str = "srvwatch.Endpoints";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ServingStatus {
    Serving,
    NotServing,
    /// Nothing has ever been reported for this name.
    ServiceUnknown,
}

/// Tracks the serving status of each named service.
///
/// Clones share the same statuses.
#[derive(Clone)]
pub struct Health {
    tx: watch::Sender<BTreeMap<String, ServingStatus>>,
}

impl Health {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { tx }
    }

    pub fn set_serving(&self, name: &str) {
        self.set(name, ServingStatus::Serving);
    }

    pub fn set_not_serving(&self, name: &str) {
        self.set(name, ServingStatus::NotServing);
    }

    fn set(&self, name: &str, status: ServingStatus) {
        let changed = self.tx.send_if_modified(|statuses| {
            match statuses.insert(name.to_string(), status) {
                Some(old) => old != status,
                None => true,
            }
        });
        if changed {
            event!(Level::INFO, name, ?status, "Serving status changed");
        }
    }

    pub fn status(&self, name: &str) -> ServingStatus {
        status_of(&self.tx.borrow(), name)
    }

    /// Returns the current status of `name`, followed by each change to it.
    ///
    /// The stream ends once every clone of this [Health] has been dropped.
    pub fn watch(&self, name: &str) -> impl Stream<Item = ServingStatus> + Send + 'static {
        let name = name.to_string();
        let mut last = None;
        WatchStream::new(self.tx.subscribe())
            .map(move |statuses| status_of(&statuses, &name))
            .filter(move |status| {
                let changed = last != Some(*status);
                last = Some(*status);
                futures::future::ready(changed)
            })
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

fn status_of(statuses: &BTreeMap<String, ServingStatus>, name: &str) -> ServingStatus {
    statuses
        .get(name)
        .copied()
        .unwrap_or(ServingStatus::ServiceUnknown)
}
