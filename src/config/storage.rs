//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::storage::{CollectionSettings, DEFAULT_CURSOR_CHUNK_SIZE};

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Postgres,
    #[default]
    Sqlite,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// PostgreSQL-specific configuration.
    pub postgres: PostgresConfig,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
    /// Collection (table) names served by the client.
    pub collections: Vec<String>,
    /// Connection pool sizing.
    pub pool: PoolConfig,
    /// Upper bound on each storage call, in milliseconds. Unset waits indefinitely.
    pub operation_timeout_ms: Option<u64>,
    /// Snapshots a cursor buffers ahead of the reader.
    pub cursor_chunk_size: usize,
    /// Create missing collection tables on connect.
    pub ensure_schema: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Sqlite,
            postgres: PostgresConfig::default(),
            sqlite: SqliteConfig::default(),
            collections: Vec::new(),
            pool: PoolConfig::default(),
            operation_timeout_ms: None,
            cursor_chunk_size: DEFAULT_CURSOR_CHUNK_SIZE,
            ensure_schema: true,
        }
    }
}

impl StorageConfig {
    /// Per-operation settings handed to every collection handle.
    pub fn settings(&self) -> CollectionSettings {
        CollectionSettings {
            operation_timeout: self.operation_timeout_ms.map(Duration::from_millis),
            cursor_chunk_size: self.cursor_chunk_size.max(1),
        }
    }
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// PostgreSQL connection URI.
    pub uri: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/chainstore".to_string(),
        }
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file path, or `:memory:`.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
        }
    }
}

impl SqliteConfig {
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// sqlx connection string; file databases are created when missing.
    pub fn connection_uri(&self) -> String {
        if self.is_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", self.path)
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open connections.
    pub max_connections: u32,
    /// Seconds to wait for a free connection before failing.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}
