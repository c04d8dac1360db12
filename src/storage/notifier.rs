//! In-process change notification.
//!
//! Each collection owns one `ChangeNotifier`. Observers run on the task that
//! committed the write, after the commit, once per written snapshot. This is
//! not a durable or cross-process feed; it exists to keep caches and search
//! indexes warm.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::Snapshot;

/// Callback invoked after a write commits.
pub trait Observer: Send + Sync {
    fn on_commit(&self, collection: &str, snapshot: &Snapshot);
}

impl<F> Observer for F
where
    F: Fn(&str, &Snapshot) + Send + Sync,
{
    fn on_commit(&self, collection: &str, snapshot: &Snapshot) {
        self(collection, snapshot)
    }
}

/// Observer list for one collection.
pub struct ChangeNotifier {
    collection: String,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl ChangeNotifier {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Register an observer.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
        info!(collection = %self.collection, "Registered change observer");
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver a committed snapshot to every observer.
    ///
    /// A panicking observer is logged and skipped; the remaining observers
    /// still run and the caller's write result is unaffected.
    pub fn notify(&self, snapshot: &Snapshot) {
        // Snapshot the list so observers may subscribe from inside a callback
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.on_commit(&self.collection, snapshot)
            }));
            if outcome.is_err() {
                error!(
                    collection = %self.collection,
                    id = %snapshot.entity_id(),
                    snapshot_id = %snapshot.snapshot_id(),
                    "Change observer panicked"
                );
            }
        }
    }
}

/// A committed write, as delivered through a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
    pub snapshot: Snapshot,
}

/// Observer that hands snapshots to a bounded channel.
///
/// Lets slow consumers (an indexer, say) work off the committing task. When
/// the channel is full the event is dropped and counted rather than
/// blocking the writer.
pub struct ChannelObserver {
    sender: mpsc::Sender<ChangeEvent>,
    dropped: AtomicU64,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let observer = Arc::new(Self {
            sender,
            dropped: AtomicU64::new(0),
        });
        (observer, receiver)
    }

    /// Number of events discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Observer for ChannelObserver {
    fn on_commit(&self, collection: &str, snapshot: &Snapshot) {
        let event = ChangeEvent {
            collection: collection.to_string(),
            snapshot: snapshot.clone(),
        };
        if let Err(e) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                collection = %collection,
                id = %snapshot.entity_id(),
                error = %e,
                "Dropped change notification"
            );
        }
    }
}
