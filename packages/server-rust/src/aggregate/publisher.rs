//! Fan-out of snapshots to observers.
//!
//! Each subscriber gets a small bounded channel. Publishing never blocks: a
//! subscriber whose buffer is full simply misses that update and catches up
//! on the next one, since every snapshot is complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use darkroom_core::Snapshot;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::telemetry::metric_names;

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

#[derive(Debug)]
pub struct SnapshotPublisher {
    subscribers: DashMap<u64, mpsc::Sender<Arc<Snapshot>>>,
    next_id: AtomicU64,
    latest: ArcSwap<Snapshot>,
    buffer: usize,
}

impl SnapshotPublisher {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            latest: ArcSwap::from_pointee(Snapshot::default()),
            buffer: buffer.max(1),
        }
    }

    /// The most recently published snapshot.
    #[must_use]
    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.load_full()
    }

    /// Registers an observer. The current snapshot is queued first, so a new
    /// subscriber never waits for the next change to see state.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        // Fresh channel, cannot be full.
        let _ = tx.try_send(self.latest());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        Subscription { id, rx }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stores `snapshot` as latest and offers it to every subscriber.
    pub fn publish(&self, snapshot: Snapshot) -> PublishReport {
        let snapshot = Arc::new(snapshot);
        self.latest.store(Arc::clone(&snapshot));

        let mut report = PublishReport::default();
        self.subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&snapshot)) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                trace!(subscriber = id, "subscriber lagging, snapshot dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                report.pruned += 1;
                false
            }
        });

        if report.dropped > 0 {
            metrics::counter!(metric_names::SNAPSHOTS_DROPPED).increment(report.dropped as u64);
        }
        report
    }
}

/// Receiving side of a snapshot subscription. Dropping it unsubscribes at the
/// next publish.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next snapshot, or `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.recv().await
    }

    /// Newest snapshot already buffered, skipping older ones.
    pub fn latest_buffered(&mut self) -> Option<Arc<Snapshot>> {
        let mut newest = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            newest = Some(snapshot);
        }
        newest
    }
}
