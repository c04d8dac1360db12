//! Forward-only streaming cursor over snapshot reads.
//!
//! A cursor is the receiving end of a bounded channel fed by a producer task
//! that owns the database connection. At most `capacity` snapshots sit in
//! memory at once. Dropping or closing the cursor closes the channel and the
//! producer releases its connection at once, so an early `break` out of a
//! read loop never leaks a connection.

use std::future::Future;

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Result, Snapshot, StoreError};

/// Streaming iterator over a batch or full-scan result set.
///
/// ```ignore
/// let mut cursor = collection.get_all();
/// while cursor.next().await {
///     let doc: Publication = cursor.scan()?;
/// }
/// if let Some(err) = cursor.err() {
///     return Err(err);
/// }
/// ```
pub struct Cursor {
    receiver: Option<mpsc::Receiver<Result<Snapshot>>>,
    current: Option<Snapshot>,
    error: Option<StoreError>,
}

impl Cursor {
    /// Start `producer` on the runtime, feeding a channel of `capacity`.
    ///
    /// An error returned by the producer becomes the cursor's `err()`.
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<F, Fut>(capacity: usize, producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Snapshot>>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let errors = sender.clone();
        let task = producer(sender);

        tokio::spawn(async move {
            if let Err(e) = task.await {
                debug!(error = %e, "Cursor producer failed");
                let _ = errors.send(Err(e)).await;
            }
        });

        Self {
            receiver: Some(receiver),
            current: None,
            error: None,
        }
    }

    /// A cursor with no rows.
    pub fn empty() -> Self {
        Self {
            receiver: None,
            current: None,
            error: None,
        }
    }

    /// Advance to the next snapshot. Returns false when exhausted or failed.
    pub async fn next(&mut self) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            self.current = None;
            return false;
        };

        match receiver.recv().await {
            Some(Ok(snapshot)) => {
                self.current = Some(snapshot);
                true
            }
            Some(Err(e)) => {
                self.error = Some(e);
                self.release();
                false
            }
            None => {
                self.release();
                false
            }
        }
    }

    /// The snapshot the cursor is positioned on.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    /// Deserialize the current snapshot's payload.
    pub fn scan<T: DeserializeOwned>(&self) -> Result<T> {
        self.current
            .as_ref()
            .ok_or(StoreError::NoCurrentRow)?
            .decode()
    }

    /// The error that ended iteration, if any.
    pub fn err(&self) -> Option<&StoreError> {
        self.error.as_ref()
    }

    /// Take the error that ended iteration, if any.
    pub fn take_err(&mut self) -> Option<StoreError> {
        self.error.take()
    }

    /// Stop reading and release the underlying connection.
    pub fn close(mut self) {
        self.release();
    }

    /// Drain the remaining snapshots into memory.
    ///
    /// Only for result sets known to be small; prefer `next()` for scans.
    pub async fn try_collect(mut self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        while self.next().await {
            if let Some(snapshot) = self.current.take() {
                snapshots.push(snapshot);
            }
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(snapshots),
        }
    }

    /// Adapt the cursor into a `Stream` of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Result<Snapshot>> {
        futures::stream::unfold(self, |mut cursor| async move {
            if cursor.next().await {
                let snapshot = cursor.current.take()?;
                Some((Ok(snapshot), cursor))
            } else {
                cursor.error.take().map(|e| (Err(e), cursor))
            }
        })
    }

    fn release(&mut self) {
        self.current = None;
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }
    }
}
