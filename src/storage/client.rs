//! Storage client: connection pool plus named collections.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sqlx::pool::PoolOptions;
use tracing::{debug, info, warn};

use super::collection::{Collection, CollectionSettings};
use super::notifier::ChangeNotifier;
use super::schema::validate_collection_name;
use super::sql::SqlDatabase;
use super::transaction::{guarded, in_transaction, TransactionScope};
use super::{Result, StoreError};
use crate::config::{StorageConfig, StorageType};

/// Owns the pool and one `Collection` per configured name.
///
/// Cheap to clone; clones share the pool, the collections and their
/// observers.
pub struct StorageClient<DB: SqlDatabase> {
    pool: sqlx::Pool<DB>,
    collections: Arc<HashMap<String, Collection<DB>>>,
    settings: CollectionSettings,
}

impl<DB: SqlDatabase> Clone for StorageClient<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            collections: self.collections.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<DB: SqlDatabase> StorageClient<DB> {
    /// Open a pool on `dsn` and serve `names`, creating missing tables.
    ///
    /// Fails fast when no connection can be established.
    pub async fn new(dsn: &str, names: &[&str]) -> Result<Self> {
        let pool = PoolOptions::<DB>::new().connect(dsn).await?;
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let client = Self::with_pool(pool, &names, CollectionSettings::default())?;
        client.ensure_schema().await?;
        Ok(client)
    }

    /// Build a client from configuration.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        if config.storage_type != DB::STORAGE_TYPE {
            warn!(
                configured = ?config.storage_type,
                backend = ?DB::STORAGE_TYPE,
                "Storage type does not match backend; using backend section"
            );
        }

        // Each connection to an in-memory SQLite database sees its own
        // empty database, so the pool keeps exactly one alive.
        let in_memory = DB::STORAGE_TYPE == StorageType::Sqlite && config.sqlite.is_memory();
        let mut options = PoolOptions::<DB>::new()
            .max_connections(config.pool.max_connections.max(1))
            .acquire_timeout(config.pool.acquire_timeout());
        if in_memory {
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options.connect(&DB::connection_uri(config)).await?;
        info!(
            backend = ?DB::STORAGE_TYPE,
            collections = config.collections.len(),
            "Storage connected"
        );

        let client = Self::with_pool(pool, &config.collections, config.settings())?;
        if config.ensure_schema {
            client.ensure_schema().await?;
        }
        Ok(client)
    }

    /// Wrap an existing pool.
    pub fn with_pool(
        pool: sqlx::Pool<DB>,
        names: &[String],
        settings: CollectionSettings,
    ) -> Result<Self> {
        let mut collections = HashMap::with_capacity(names.len());
        for name in names {
            validate_collection_name(name)?;
            let notifier = Arc::new(ChangeNotifier::new(name));
            collections.insert(
                name.clone(),
                Collection::new(name, pool.clone(), notifier, settings.clone()),
            );
        }

        Ok(Self {
            pool,
            collections: Arc::new(collections),
            settings,
        })
    }

    /// Create missing tables and current-snapshot indexes.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for name in self.collections.keys() {
            DB::create_table(&mut conn, name).await?;
            debug!(collection = %name, "Collection schema ensured");
        }
        Ok(())
    }

    /// Look up a configured collection.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a configured collection.
    pub fn collection(&self, name: &str) -> &Collection<DB> {
        self.collections
            .get(name)
            .unwrap_or_else(|| panic!("unknown collection: {name}"))
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn pool(&self) -> &sqlx::Pool<DB> {
        &self.pool
    }

    /// Close the pool; outstanding connections finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `body` inside one database transaction.
    ///
    /// `Ok` commits and then delivers the change notifications raised
    /// inside the body; `Err` rolls back and discards them. Dropping the
    /// returned future before it completes rolls back as well.
    ///
    /// Calling `transaction` from inside a body fails with
    /// `NestedTransaction`. The guard is task-local: a task spawned with
    /// `tokio::spawn` from the body is not inside the transaction, so it
    /// can open an independent one and its writes are not part of this
    /// scope.
    pub async fn transaction<F, Fut, T, E>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionScope<DB>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StoreError>,
    {
        if in_transaction() {
            return Err(StoreError::NestedTransaction.into());
        }

        let tx = self
            .settings
            .bounded(async { self.pool.begin().await.map_err(StoreError::from) })
            .await?;
        let notifiers = self
            .collections
            .iter()
            .map(|(name, collection)| (name.clone(), collection.notifier().clone()))
            .collect();
        let scope = TransactionScope::new(tx, notifiers, self.settings.clone());

        match guarded(body(scope.clone())).await {
            Ok(value) => {
                let tx = scope.take().await.ok_or(StoreError::TransactionClosed)?;
                if let Err(e) = self
                    .settings
                    .bounded(async { tx.commit().await.map_err(StoreError::from) })
                    .await
                {
                    let discarded = scope.discard();
                    warn!(error = %e, discarded, "Transaction commit failed");
                    return Err(e.into());
                }
                scope.publish();
                Ok(value)
            }
            Err(e) => {
                if let Some(tx) = scope.take().await {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback failed");
                    }
                }
                let discarded = scope.discard();
                debug!(discarded, "Transaction rolled back");
                Err(e)
            }
        }
    }
}
