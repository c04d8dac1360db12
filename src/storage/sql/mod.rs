//! SQL backends for snapshot-chain tables.
//!
//! Collection logic is written once against the `SqlDatabase` trait; the
//! per-database statement execution is generated by `impl_sql_database!`
//! for PostgreSQL and SQLite.

#[macro_use]
mod backend;
mod query;

pub use query::RowFilter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::{StorageConfig, StorageType};
use crate::storage::{Result, Snapshot, SnapshotId};

/// Statement execution for one SQL database.
///
/// Every function runs on a caller-provided connection, which is either a
/// pooled connection or the connection owned by an open transaction. None of
/// them begins or commits a transaction on its own.
#[async_trait]
pub trait SqlDatabase: sqlx::Database {
    /// Which `StorageConfig` section configures this backend.
    const STORAGE_TYPE: StorageType;

    /// Connection string taken from configuration.
    fn connection_uri(config: &StorageConfig) -> String;

    /// Create the collection table and its current-snapshot index.
    async fn create_table(conn: &mut Self::Connection, table: &str) -> Result<()>;

    /// Insert a first snapshot unless `id` already has a current one.
    ///
    /// Returns the new snapshot id and its `valid_from`, or `None` when the
    /// guard (or the unique index, under a race) rejected the row. Never
    /// fails on the index, so an enclosing transaction stays usable.
    async fn insert_guarded(
        conn: &mut Self::Connection,
        table: &str,
        id: &str,
        payload: &[u8],
    ) -> Result<Option<(SnapshotId, DateTime<Utc>)>>;

    /// Close the current snapshot if it is `prev`.
    ///
    /// Returns the stored `valid_to`, never earlier than the row's
    /// `valid_from`, or `None` when `prev` is no longer current.
    async fn close_current(
        conn: &mut Self::Connection,
        table: &str,
        id: &str,
        prev: SnapshotId,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Insert the successor of a snapshot closed in the same transaction.
    async fn insert_successor(
        conn: &mut Self::Connection,
        table: &str,
        id: &str,
        payload: &[u8],
        valid_from: DateTime<Utc>,
    ) -> Result<SnapshotId>;

    /// First row matching `filter`.
    async fn fetch_one(
        conn: &mut Self::Connection,
        table: &str,
        filter: &RowFilter,
    ) -> Result<Option<Snapshot>>;

    /// Up to `limit` rows matching `filter` with a snapshot id above `after`.
    async fn fetch_page(
        conn: &mut Self::Connection,
        table: &str,
        filter: &RowFilter,
        after: Option<SnapshotId>,
        limit: u64,
    ) -> Result<Vec<Snapshot>>;

    /// Stream every row matching `filter` into `sink` from one statement.
    ///
    /// Stops early, releasing the result set, once the receiving cursor is
    /// dropped.
    async fn stream_rows(
        conn: &mut Self::Connection,
        table: &str,
        filter: &RowFilter,
        sink: &mpsc::Sender<Result<Snapshot>>,
    ) -> Result<()>;
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! PostgreSQL backend.

    use sea_query::{Expr, PostgresQueryBuilder, SimpleExpr};

    use crate::config::{StorageConfig, StorageType};
    use crate::storage::schema;

    // Timestamps come from the database server so that writers on hosts
    // with skewed clocks still produce one ordered timeline.
    impl_sql_database!(
        sqlx::Postgres,
        PostgresQueryBuilder,
        storage_type: StorageType::Postgres,
        ddl: schema::postgres_ddl,
        uri: |config: &StorageConfig| config.postgres.uri.clone(),
        clock: || -> SimpleExpr { Expr::cust("clock_timestamp()") }
    );

    /// PostgreSQL storage client.
    pub type PostgresStorageClient = crate::storage::StorageClient<sqlx::Postgres>;

    /// PostgreSQL collection.
    pub type PostgresCollection = crate::storage::Collection<sqlx::Postgres>;
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite backend.

    use sea_query::{Expr, SimpleExpr, SqliteQueryBuilder};

    use crate::config::{StorageConfig, StorageType};
    use crate::storage::schema;
    use crate::storage::snapshot::commit_time;

    // SQLite is embedded, so the process clock is the database clock. Its
    // own `datetime('now')` only has millisecond text precision.
    impl_sql_database!(
        sqlx::Sqlite,
        SqliteQueryBuilder,
        storage_type: StorageType::Sqlite,
        ddl: schema::sqlite_ddl,
        uri: |config: &StorageConfig| config.sqlite.connection_uri(),
        clock: || -> SimpleExpr { Expr::val(commit_time()).into() }
    );

    /// SQLite storage client.
    pub type SqliteStorageClient = crate::storage::StorageClient<sqlx::Sqlite>;

    /// SQLite collection.
    pub type SqliteCollection = crate::storage::Collection<sqlx::Sqlite>;
}
