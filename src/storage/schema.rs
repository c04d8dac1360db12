//! Collection table schema.
//!
//! Every collection is one table with the same columns. Table names come
//! from configuration, so they are validated as plain identifiers before
//! they ever reach a statement.

use sea_query::Iden;

use super::{Result, StoreError};

/// Snapshot-chain table columns.
#[derive(Iden, Clone, Copy)]
pub enum Chain {
    #[iden = "snapshot_id"]
    SnapshotId,
    #[iden = "id"]
    Id,
    #[iden = "data"]
    Data,
    #[iden = "valid_from"]
    ValidFrom,
    #[iden = "valid_to"]
    ValidTo,
}

/// Longest name PostgreSQL accepts once the index suffix is appended.
const MAX_COLLECTION_NAME: usize = 48;

/// Reject anything that is not a plain lowercase SQL identifier.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_COLLECTION_NAME {
        Ok(())
    } else {
        Err(StoreError::InvalidCollectionName(name.to_string()))
    }
}

/// Name of the partial unique index guarding the current snapshot.
pub fn current_index_name(table: &str) -> String {
    format!("{}_current_idx", table)
}

/// DDL for a PostgreSQL collection table.
pub fn postgres_ddl(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    snapshot_id BIGSERIAL PRIMARY KEY,
    id TEXT NOT NULL,
    data BYTEA NOT NULL,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ NULL
)"#
        ),
        format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "{index}" ON "{table}" (id) WHERE valid_to IS NULL"#,
            index = current_index_name(table)
        ),
    ]
}

/// DDL for a SQLite collection table.
pub fn sqlite_ddl(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    valid_from TEXT NOT NULL,
    valid_to TEXT NULL
)"#
        ),
        format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "{index}" ON "{table}" (id) WHERE valid_to IS NULL"#,
            index = current_index_name(table)
        ),
    ]
}
