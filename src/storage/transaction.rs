//! Transaction-scoped collection handles.
//!
//! A `TransactionScope` wraps one open database transaction. The
//! `ScopedCollection` handles it hands out implement the same
//! `SnapshotCollection` trait as pooled collections, but every statement
//! runs on the shared transaction. Change notifications raised inside the
//! scope are held back until the transaction commits and discarded if it
//! rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::collection::{add_on, ids_filters, supersede_on, CollectionSettings};
use super::notifier::ChangeNotifier;
use super::sql::{RowFilter, SqlDatabase};
use super::{Cursor, Payload, Result, Snapshot, SnapshotCollection, SnapshotId, StoreError};

tokio::task_local! {
    /// Set while a transaction body runs; guards against nesting. Tasks
    /// spawned from the body do not inherit it.
    static IN_TRANSACTION: ();
}

/// True when called from inside a `StorageClient::transaction` body.
pub(crate) fn in_transaction() -> bool {
    IN_TRANSACTION.try_with(|_| ()).is_ok()
}

/// Run a transaction body with the nesting guard set.
pub(crate) async fn guarded<F: std::future::Future>(body: F) -> F::Output {
    IN_TRANSACTION.scope((), body).await
}

struct ScopeState<DB: SqlDatabase> {
    tx: AsyncMutex<Option<sqlx::Transaction<'static, DB>>>,
    notifiers: HashMap<String, Arc<ChangeNotifier>>,
    pending: Mutex<Vec<(Arc<ChangeNotifier>, Snapshot)>>,
    settings: CollectionSettings,
}

/// One atomic, multi-collection unit of work.
///
/// Cheap to clone. Handles obtained from a scope stop working once the
/// transaction has committed or rolled back (`TransactionClosed`).
pub struct TransactionScope<DB: SqlDatabase> {
    state: Arc<ScopeState<DB>>,
}

impl<DB: SqlDatabase> Clone for TransactionScope<DB> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<DB: SqlDatabase> TransactionScope<DB> {
    pub(crate) fn new(
        tx: sqlx::Transaction<'static, DB>,
        notifiers: HashMap<String, Arc<ChangeNotifier>>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            state: Arc::new(ScopeState {
                tx: AsyncMutex::new(Some(tx)),
                notifiers,
                pending: Mutex::new(Vec::new()),
                settings,
            }),
        }
    }

    /// Transaction-bound handle for a configured collection.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a configured collection.
    pub fn collection(&self, name: &str) -> ScopedCollection<DB> {
        let (name, notifier) = self
            .state
            .notifiers
            .get_key_value(name)
            .unwrap_or_else(|| panic!("unknown collection: {name}"));

        ScopedCollection {
            name: Arc::from(name.as_str()),
            notifier: notifier.clone(),
            state: self.state.clone(),
        }
    }

    /// Take the transaction out; later statements see `TransactionClosed`.
    pub(crate) async fn take(&self) -> Option<sqlx::Transaction<'static, DB>> {
        self.state.tx.lock().await.take()
    }

    /// Deliver notifications held back during the transaction.
    pub(crate) fn publish(&self) {
        let pending = std::mem::take(
            &mut *self
                .state
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (notifier, snapshot) in pending {
            notifier.notify(&snapshot);
        }
    }

    /// Drop notifications of a rolled-back transaction.
    pub(crate) fn discard(&self) -> usize {
        let mut pending = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let discarded = pending.len();
        pending.clear();
        discarded
    }
}

/// Collection handle bound to an open transaction.
pub struct ScopedCollection<DB: SqlDatabase> {
    name: Arc<str>,
    notifier: Arc<ChangeNotifier>,
    state: Arc<ScopeState<DB>>,
}

impl<DB: SqlDatabase> Clone for ScopedCollection<DB> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            notifier: self.notifier.clone(),
            state: self.state.clone(),
        }
    }
}

impl<DB: SqlDatabase> ScopedCollection<DB> {
    fn defer(&self, snapshot: &Snapshot) {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.notifier.clone(), snapshot.clone()));
    }

    async fn fetch_one(&self, filter: RowFilter) -> Result<Option<Snapshot>> {
        self.state
            .settings
            .bounded(async {
                let mut guard = self.state.tx.lock().await;
                let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
                DB::fetch_one(tx, &self.name, &filter).await
            })
            .await
    }

    /// Page through `filters`, in order, on the transaction connection.
    ///
    /// The transaction has a single connection, so the cursor only holds it
    /// while fetching one page; other statements in the scope interleave
    /// between pages.
    fn paged(&self, filters: Vec<RowFilter>) -> Cursor {
        let state = self.state.clone();
        let table = self.name.clone();
        let chunk = state.settings.cursor_chunk_size.max(1);

        Cursor::spawn(chunk, move |sink| async move {
            for filter in &filters {
                let mut after = None;
                loop {
                    let page = state
                        .settings
                        .bounded(async {
                            let mut guard = state.tx.lock().await;
                            let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
                            DB::fetch_page(tx, &table, filter, after, chunk as u64).await
                        })
                        .await?;

                    let exhausted = page.len() < chunk;
                    for snapshot in page {
                        after = Some(snapshot.snapshot_id());
                        if sink.send(Ok(snapshot)).await.is_err() {
                            return Ok(());
                        }
                    }
                    if exhausted {
                        break;
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl<DB: SqlDatabase> SnapshotCollection for ScopedCollection<DB> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, id: &str, payload: Payload) -> Result<Snapshot> {
        let snapshot = self
            .state
            .settings
            .bounded(async {
                let mut guard = self.state.tx.lock().await;
                let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
                add_on::<DB>(tx, &self.name, id, payload).await
            })
            .await?;

        debug!(
            collection = %self.name,
            id = %id,
            snapshot_id = %snapshot.snapshot_id(),
            "Added entity in transaction"
        );
        self.defer(&snapshot);
        Ok(snapshot)
    }

    async fn add_after(&self, prev: SnapshotId, id: &str, payload: Payload) -> Result<Snapshot> {
        let snapshot = self
            .state
            .settings
            .bounded(async {
                let mut guard = self.state.tx.lock().await;
                let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
                supersede_on::<DB>(tx, &self.name, prev, id, payload).await
            })
            .await?;

        debug!(
            collection = %self.name,
            id = %id,
            prev = %prev,
            snapshot_id = %snapshot.snapshot_id(),
            "Superseded snapshot in transaction"
        );
        self.defer(&snapshot);
        Ok(snapshot)
    }

    async fn get_current_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.fetch_one(RowFilter::Current(id.to_string()))
            .await?
            .ok_or_else(|| StoreError::not_found(&self.name, id))
    }

    async fn get_at(&self, id: &str, at: DateTime<Utc>) -> Result<Snapshot> {
        self.fetch_one(RowFilter::At(id.to_string(), at))
            .await?
            .ok_or_else(|| StoreError::not_found(&self.name, id))
    }

    fn get_by_id(&self, ids: &[&str]) -> Cursor {
        if ids.is_empty() {
            return Cursor::empty();
        }
        self.paged(ids_filters(ids, self.state.settings.cursor_chunk_size))
    }

    fn get_all(&self) -> Cursor {
        self.paged(vec![RowFilter::AllCurrent])
    }

    fn get_history(&self, id: &str) -> Cursor {
        self.paged(vec![RowFilter::History(id.to_string())])
    }
}
