//! Snapshot-chain collections.
//!
//! A collection keeps, per entity id, an append-only chain of snapshots of
//! which at most one is current. Correctness under concurrency rests on the
//! database alone: `add` is a guarded insert backed by a partial unique
//! index, and `add_after` is a compare-and-swap `UPDATE ... WHERE
//! snapshot_id = prev AND valid_to IS NULL` inside a transaction. No
//! in-process lock is taken.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::notifier::{ChangeNotifier, Observer};
use super::sql::{RowFilter, SqlDatabase};
use super::{Cursor, Payload, Result, Snapshot, SnapshotId, StoreError};

/// Default number of snapshots a cursor buffers.
pub const DEFAULT_CURSOR_CHUNK_SIZE: usize = 256;

/// Most ids bound into one `get_by_id` statement.
const MAX_IDS_PER_STATEMENT: usize = 1000;

/// Operations every collection handle offers, pooled or transaction-bound.
///
/// Reads through `get_by_id` silently omit ids that have no current
/// snapshot; callers compare the returned ids with the requested ones when
/// they need to know what is missing.
#[async_trait]
pub trait SnapshotCollection: Send + Sync {
    /// Collection (table) name.
    fn name(&self) -> &str;

    /// Create the first snapshot of `id`.
    ///
    /// Fails with `Integrity` if `id` already has a current snapshot.
    async fn add(&self, id: &str, payload: Payload) -> Result<Snapshot>;

    /// Supersede snapshot `prev` of `id` with a new current snapshot.
    ///
    /// Fails with `Conflict` unless `prev` is still the current snapshot.
    async fn add_after(&self, prev: SnapshotId, id: &str, payload: Payload) -> Result<Snapshot>;

    /// The current snapshot of `id`, or `NotFound`.
    async fn get_current_snapshot(&self, id: &str) -> Result<Snapshot>;

    /// The snapshot of `id` that was current at `at`, or `NotFound`.
    async fn get_at(&self, id: &str, at: DateTime<Utc>) -> Result<Snapshot>;

    /// Current snapshots of the given ids, missing ids omitted.
    fn get_by_id(&self, ids: &[&str]) -> Cursor;

    /// Every current snapshot in the collection.
    fn get_all(&self) -> Cursor;

    /// Every snapshot of `id`, oldest first.
    fn get_history(&self, id: &str) -> Cursor;
}

/// Per-operation tuning shared by the handles of one client.
#[derive(Debug, Clone)]
pub struct CollectionSettings {
    /// Upper bound on every storage call; `None` waits indefinitely.
    pub operation_timeout: Option<Duration>,
    /// Snapshots buffered by a cursor (and page size inside transactions).
    pub cursor_chunk_size: usize,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            cursor_chunk_size: DEFAULT_CURSOR_CHUNK_SIZE,
        }
    }
}

impl CollectionSettings {
    /// Run `fut` under the configured timeout.
    ///
    /// An expired timeout drops the future, which aborts the statement and
    /// rolls back any transaction it had open.
    pub(crate) async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => fut.await,
        }
    }
}

/// Insert the first snapshot of `id` on `conn`.
pub(crate) async fn add_on<DB: SqlDatabase>(
    conn: &mut DB::Connection,
    table: &str,
    id: &str,
    payload: Payload,
) -> Result<Snapshot> {
    match DB::insert_guarded(conn, table, id, payload.as_bytes()).await? {
        Some((snapshot_id, valid_from)) => Ok(Snapshot::new(
            id.to_string(),
            snapshot_id,
            payload,
            valid_from,
            None,
        )),
        None => Err(StoreError::integrity(table, id)),
    }
}

/// Close `prev` and open its successor on `conn`.
///
/// Must run inside a transaction; on `Conflict` nothing was written. The
/// successor opens at exactly the instant its predecessor closed.
pub(crate) async fn supersede_on<DB: SqlDatabase>(
    conn: &mut DB::Connection,
    table: &str,
    prev: SnapshotId,
    id: &str,
    payload: Payload,
) -> Result<Snapshot> {
    let Some(closed_at) = DB::close_current(conn, table, id, prev).await? else {
        return Err(StoreError::conflict(table, id, prev));
    };

    let snapshot_id = DB::insert_successor(conn, table, id, payload.as_bytes(), closed_at).await?;
    Ok(Snapshot::new(
        id.to_string(),
        snapshot_id,
        payload,
        closed_at,
        None,
    ))
}

/// Split a `get_by_id` request into statements of at most `batch` ids.
///
/// Keeps every statement well under the bind-parameter limits of the
/// backends however many ids are requested.
pub(crate) fn ids_filters(ids: &[&str], batch: usize) -> Vec<RowFilter> {
    ids.chunks(batch.clamp(1, MAX_IDS_PER_STATEMENT))
        .map(|chunk| RowFilter::CurrentIn(chunk.iter().map(|id| id.to_string()).collect()))
        .collect()
}

/// Pool-backed collection handle.
///
/// Cheap to clone; every clone shares the pool and the observer list.
pub struct Collection<DB: SqlDatabase> {
    name: Arc<str>,
    pool: sqlx::Pool<DB>,
    notifier: Arc<ChangeNotifier>,
    settings: CollectionSettings,
}

impl<DB: SqlDatabase> Clone for Collection<DB> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pool: self.pool.clone(),
            notifier: self.notifier.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<DB: SqlDatabase> Collection<DB> {
    pub(crate) fn new(
        name: &str,
        pool: sqlx::Pool<DB>,
        notifier: Arc<ChangeNotifier>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            name: Arc::from(name),
            pool,
            notifier,
            settings,
        }
    }

    /// Register an observer fired once per committed write.
    pub fn listen(&self, observer: Arc<dyn Observer>) {
        self.notifier.subscribe(observer);
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Stream `filters`, one statement after another, over a dedicated
    /// pooled connection.
    fn stream(&self, filters: Vec<RowFilter>) -> Cursor {
        let pool = self.pool.clone();
        let table = self.name.clone();
        let settings = self.settings.clone();

        Cursor::spawn(self.settings.cursor_chunk_size, move |sink| async move {
            let mut conn = settings
                .bounded(async { pool.acquire().await.map_err(StoreError::from) })
                .await?;
            for filter in &filters {
                if sink.is_closed() {
                    break;
                }
                DB::stream_rows(&mut conn, &table, filter, &sink).await?;
            }
            Ok(())
        })
    }

    async fn fetch_one(&self, filter: RowFilter) -> Result<Option<Snapshot>> {
        self.settings
            .bounded(async {
                let mut conn = self.pool.acquire().await?;
                DB::fetch_one(&mut conn, &self.name, &filter).await
            })
            .await
    }
}

#[async_trait]
impl<DB: SqlDatabase> SnapshotCollection for Collection<DB> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, id: &str, payload: Payload) -> Result<Snapshot> {
        let snapshot = self
            .settings
            .bounded(async {
                let mut conn = self.pool.acquire().await?;
                add_on::<DB>(&mut conn, &self.name, id, payload).await
            })
            .await?;

        debug!(
            collection = %self.name,
            id = %id,
            snapshot_id = %snapshot.snapshot_id(),
            "Added entity"
        );
        self.notifier.notify(&snapshot);
        Ok(snapshot)
    }

    async fn add_after(&self, prev: SnapshotId, id: &str, payload: Payload) -> Result<Snapshot> {
        let outcome = self
            .settings
            .bounded(async {
                let mut tx = self.pool.begin().await?;
                match supersede_on::<DB>(&mut tx, &self.name, prev, id, payload).await {
                    Ok(snapshot) => {
                        tx.commit().await?;
                        Ok(snapshot)
                    }
                    Err(e) => {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(collection = %self.name, error = %rollback, "Rollback failed");
                        }
                        Err(e)
                    }
                }
            })
            .await;

        match outcome {
            Ok(snapshot) => {
                debug!(
                    collection = %self.name,
                    id = %id,
                    prev = %prev,
                    snapshot_id = %snapshot.snapshot_id(),
                    "Superseded snapshot"
                );
                self.notifier.notify(&snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(collection = %self.name, id = %id, prev = %prev, "Stale snapshot token");
                }
                Err(e)
            }
        }
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
        self.stream(ids_filters(ids, self.settings.cursor_chunk_size))
    }

    fn get_all(&self) -> Cursor {
        self.stream(vec![RowFilter::AllCurrent])
    }

    fn get_history(&self, id: &str) -> Cursor {
        self.stream(vec![RowFilter::History(id.to_string())])
    }
}
