//! Versioned snapshot storage.
//!
//! Every collection is one table of snapshot chains. Writes never update a
//! payload in place: `add` opens a chain, `add_after` closes the current
//! snapshot and opens its successor, guarded by the snapshot id the caller
//! read. Reads return the current snapshot, a historical one, or stream
//! through a `Cursor`.

mod client;
mod collection;
mod cursor;
mod error;
mod notifier;
pub mod schema;
mod snapshot;
pub mod sql;
mod transaction;

pub use client::StorageClient;
pub use collection::{
    Collection, CollectionSettings, SnapshotCollection, DEFAULT_CURSOR_CHUNK_SIZE,
};
pub use cursor::Cursor;
pub use error::{ErrorKind, Result, StoreError};
pub use notifier::{ChangeEvent, ChangeNotifier, ChannelObserver, Observer};
pub use snapshot::{generate_entity_id, Payload, Snapshot, SnapshotId};
pub use sql::SqlDatabase;
pub use transaction::{ScopedCollection, TransactionScope};

#[cfg(feature = "postgres")]
pub use sql::postgres::{PostgresCollection, PostgresStorageClient};

#[cfg(feature = "sqlite")]
pub use sql::sqlite::{SqliteCollection, SqliteStorageClient};
