//! Utilities to help with testing srvwatch

use crate::endpoint::{Endpoint, Snapshot};
use crate::poll::Lookup;
use crate::source::{self, Source, Updates};
use crate::target::{Key, Target};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A test-only lookup which replays a script of results.
///
/// Once the script runs out, the final entry is repeated forever.
#[derive(Clone)]
pub struct ScriptedLookup {
    script: Arc<Vec<Vec<Endpoint>>>,
    polls: Arc<AtomicUsize>,
    fail_after: Arc<AtomicUsize>,
}

impl ScriptedLookup {
    pub fn new(script: impl IntoIterator<Item = Vec<Endpoint>>) -> Self {
        Self {
            script: Arc::new(script.into_iter().collect()),
            polls: Arc::new(AtomicUsize::new(0)),
            fail_after: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Makes every lookup after the first `count` fail.
    pub fn fail_after(&self, count: usize) {
        self.fail_after.store(count, Ordering::SeqCst);
    }

    /// Counts how many lookups have been attempted.
    pub fn polls(&self) -> Arc<AtomicUsize> {
        self.polls.clone()
    }
}

#[async_trait]
impl Lookup for ScriptedLookup {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn lookup(&self) -> Result<Vec<Endpoint>, source::Error> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if poll >= self.fail_after.load(Ordering::SeqCst) {
            return Err(source::Error::Other(anyhow::anyhow!("resolver error!")));
        }
        let endpoints = self
            .script
            .get(poll)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_default();
        Ok(endpoints)
    }
}

/// A test-only source whose updates are pushed by hand.
#[derive(Default)]
pub struct ManualSource {
    senders: Mutex<HashMap<Key, mpsc::Sender<Snapshot>>>,
    invalid: Mutex<HashSet<Key>>,
    opens: AtomicUsize,
}

impl ManualSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes future attempts to open `key` fail validation.
    pub fn reject(&self, key: impl Into<Key>) {
        self.invalid.lock().unwrap().insert(key.into());
    }

    /// The number of times a target has been successfully opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Pushes a snapshot to the watcher of `key`, waiting until it has been
    /// taken.
    pub async fn push(&self, key: impl Into<Key>, snapshot: Snapshot) {
        let key = key.into();
        let tx = self
            .senders
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| panic!("{key} was never opened"));
        tx.send(snapshot).await.expect("watcher should be listening");
    }

    /// Closes the sequence for `key`, as if a later lookup failed.
    pub fn close(&self, key: impl Into<Key>) {
        self.senders.lock().unwrap().remove(&key.into());
    }
}

#[async_trait]
impl Source for ManualSource {
    async fn open(
        &self,
        target: &Target,
        _shutdown: CancellationToken,
    ) -> Result<Updates, source::Error> {
        let key = target.key();
        if self.invalid.lock().unwrap().contains(&key) {
            return Err(source::Error::Other(anyhow::anyhow!("no such target: {key}")));
        }
        let (tx, rx) = mpsc::channel(1);
        self.senders.lock().unwrap().insert(key, tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }
}

pub fn snapshot(hosts: &[(&str, u16, u16)]) -> Snapshot {
    hosts
        .iter()
        .map(|(hostname, port, weight)| Endpoint::new(hostname, *port, *weight))
        .collect()
}
