//! Implementation of [Source] that always returns a fixed set of endpoints.

use crate::endpoint::{Endpoint, Snapshot};
use crate::source::{Error, Source, Updates};
use crate::target::Target;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A [`Source`] that reports the same endpoints for every target.
///
/// The single snapshot is delivered once, and the sequence then stays open
/// until shutdown.
#[derive(Clone, Debug)]
pub struct FixedSource {
    snapshot: Snapshot,
}

impl FixedSource {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> FixedSource {
        FixedSource {
            snapshot: Snapshot::new(endpoints),
        }
    }
}

#[async_trait]
impl Source for FixedSource {
    async fn open(&self, _target: &Target, shutdown: CancellationToken) -> Result<Updates, Error> {
        let (tx, rx) = mpsc::channel(1);
        let snapshot = self.snapshot.clone();
        tokio::task::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = tx.send(snapshot) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tx.closed() => {}
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::FixedSource;
    use crate::endpoint::Endpoint;
    use crate::source::Source as _;
    use crate::target::Target;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn fixed_source_returns_endpoints() {
        let source = FixedSource::new([
            Endpoint::new("host2", 50051, 1),
            Endpoint::new("host1", 50051, 1),
        ]);
        let shutdown = CancellationToken::new();
        let mut rx = source
            .open(&Target::srv("grpc", "tcp", "example.com"), shutdown.clone())
            .await
            .unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(
            snapshot.endpoints(),
            &[
                Endpoint::new("host1", 50051, 1),
                Endpoint::new("host2", 50051, 1)
            ]
        );
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        assert!(rx.recv().await.is_none());
    }
}
