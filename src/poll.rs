//! A [Source](crate::source::Source) building block which polls a lookup on
//! a fixed period and reports only the results which changed.

use crate::endpoint::{Endpoint, Snapshot};
#[cfg(feature = "probes")]
use crate::probes;
use crate::source::{Error, Updates};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

/// A single, complete resolution of one target.
#[async_trait]
pub trait Lookup: Send + Sync + 'static {
    /// A name for this lookup, for instrumentation.
    fn name(&self) -> &str;

    /// Resolves every endpoint currently known for the target.
    async fn lookup(&self) -> Result<Vec<Endpoint>, Error>;
}

/// Validates `lookup` by running it once, then starts polling it every
/// `period` in the background.
///
/// If the first lookup fails, no background task is started.
pub async fn start<L: Lookup>(
    lookup: L,
    period: Duration,
    shutdown: CancellationToken,
) -> Result<Updates, Error> {
    lookup.lookup().await?;

    // Deliveries are a handoff: the poller may not run ahead of its consumer
    // by more than this.
    let (tx, rx) = mpsc::channel(1);
    event!(
        Level::INFO,
        name = lookup.name(),
        ?period,
        "Starting polling endpoint source"
    );
    tokio::task::spawn(run(lookup, period, tx, shutdown));
    Ok(rx)
}

/// Polls `lookup` until it fails, `shutdown` is cancelled, or the receiving
/// side of `tx` goes away.
///
/// Dropping `tx` on return closes the sequence.
#[instrument(skip_all, fields(name = lookup.name()), name = "poll::run")]
pub(crate) async fn run<L: Lookup>(
    lookup: L,
    period: Duration,
    tx: mpsc::Sender<Snapshot>,
    shutdown: CancellationToken,
) {
    // Like a ticker: the first poll happens one period from now, not
    // immediately.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The last snapshot observed, whether or not it was sent. "None" is the
    // bootstrap value, and differs from every resolved snapshot.
    let mut last: Option<Snapshot> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {},
        }

        #[cfg(feature = "probes")]
        probes::poll__start!(|| lookup.name());

        let next = match lookup.lookup().await {
            Ok(endpoints) => Snapshot::new(endpoints),
            Err(err) => {
                #[cfg(feature = "probes")]
                {
                    let reason = err.to_string();
                    probes::poll__failed!(|| (lookup.name(), reason.as_str()));
                }
                event!(Level::ERROR, ?err, "Error resolving endpoints");
                break;
            }
        };

        #[cfg(feature = "probes")]
        probes::poll__done!(|| (lookup.name(), next.len() as u64));

        if last.as_ref() != Some(&next) {
            let entries = next.len();
            event!(Level::DEBUG, entries, "Sending endpoint update");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tx.send(next.clone()) => {
                    if result.is_err() {
                        event!(Level::DEBUG, "Endpoint update receiver dropped");
                        break;
                    }
                }
            }
            event!(Level::DEBUG, entries, "Endpoint update sent");
        }
        last = Some(next);
    }

    event!(Level::INFO, "Stopping polling endpoint source");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{setup_tracing_subscriber, ScriptedLookup};

    const PERIOD: Duration = Duration::from_millis(1);

    fn spawn_run(
        lookup: ScriptedLookup,
    ) -> (Updates, CancellationToken, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::task::spawn(run(lookup, PERIOD, tx, shutdown.clone()));
        (rx, shutdown, handle)
    }

    async fn stop(
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
        rx: &mut Updates,
    ) {
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should exit")
            .expect("poller should not panic");
        assert!(rx.recv().await.is_none(), "sequence should be closed");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_response_is_sent_once() {
        setup_tracing_subscriber();
        let (mut rx, shutdown, handle) = spawn_run(ScriptedLookup::new([vec![]]));

        let update = rx.recv().await.expect("first update");
        assert!(update.is_empty());

        // The same empty set keeps coming back; nothing more is sent.
        let r = tokio::time::timeout(PERIOD * 20, rx.recv()).await;
        assert!(r.is_err(), "unchanged results should not be sent");

        stop(shutdown, handle, &mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_entry() {
        setup_tracing_subscriber();
        let (mut rx, shutdown, handle) =
            spawn_run(ScriptedLookup::new([vec![Endpoint::new("host1", 50051, 1)]]));

        let update = rx.recv().await.expect("first update");
        assert_eq!(update.endpoints(), &[Endpoint::new("host1", 50051, 1)]);

        stop(shutdown, handle, &mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn changing_entries() {
        setup_tracing_subscriber();
        let first = vec![
            Endpoint::new("host1", 50051, 1),
            Endpoint::new("host2", 50051, 2),
        ];
        let second = vec![Endpoint::new("host3", 50051, 1)];
        let (mut rx, shutdown, handle) = spawn_run(ScriptedLookup::new([first, second]));

        assert_eq!(rx.recv().await.expect("first update").len(), 2);
        assert_eq!(rx.recv().await.expect("second update").len(), 1);

        stop(shutdown, handle, &mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_results_are_suppressed() {
        setup_tracing_subscriber();
        let a = vec![Endpoint::new("host1", 50051, 1)];
        // The same set again, which should be suppressed.
        let a_again = vec![Endpoint::new("host1", 50051, 1)];
        let b = vec![
            Endpoint::new("host2", 50051, 1),
            Endpoint::new("host1", 50051, 1),
        ];
        let b_reordered = vec![
            Endpoint::new("host1", 50051, 1),
            Endpoint::new("host2", 50051, 1),
        ];
        let lookup = ScriptedLookup::new([a.clone(), a_again, b, b_reordered]);
        let polls = lookup.polls();
        let (mut rx, shutdown, handle) = spawn_run(lookup);

        assert_eq!(rx.recv().await.expect("first update"), Snapshot::new(a));
        let second = rx.recv().await.expect("second update");
        assert_eq!(second.len(), 2);

        let r = tokio::time::timeout(PERIOD * 20, rx.recv()).await;
        assert!(r.is_err(), "unchanged results should not be sent");
        assert!(polls.load(std::sync::atomic::Ordering::SeqCst) > 4);

        stop(shutdown, handle, &mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_failure_closes_sequence() {
        setup_tracing_subscriber();
        let lookup = ScriptedLookup::new([vec![Endpoint::new("host1", 50051, 1)]]);
        lookup.fail_after(1);
        let (mut rx, _shutdown, handle) = spawn_run(lookup);

        assert_eq!(rx.recv().await.expect("first update").len(), 1);
        assert!(rx.recv().await.is_none(), "failure should close the sequence");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_lookup_failure_sends_nothing() {
        setup_tracing_subscriber();
        let lookup = ScriptedLookup::new([]);
        lookup.fail_after(0);
        let (mut rx, _shutdown, handle) = spawn_run(lookup);

        assert!(rx.recv().await.is_none(), "failure should close the sequence");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_validates_before_polling() {
        setup_tracing_subscriber();
        let lookup = ScriptedLookup::new([]);
        lookup.fail_after(0);
        let polls = lookup.polls();

        let result = start(lookup, PERIOD, CancellationToken::new()).await;
        assert!(result.is_err());

        // No background polling was started.
        tokio::time::sleep(PERIOD * 20).await;
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_shutdown() {
        setup_tracing_subscriber();
        let shutdown = CancellationToken::new();
        let lookup = ScriptedLookup::new([vec![Endpoint::new("host1", 50051, 1)]]);
        let mut rx = start(lookup, PERIOD, shutdown.clone())
            .await
            .expect("validation should succeed");

        assert_eq!(rx.recv().await.expect("first update").len(), 1);
        shutdown.cancel();
        assert!(rx.recv().await.is_none());
    }
}
