//! Cross-entity linking.
//!
//! Links two entities (a publication and its author, say) so each payload
//! references the other. Both current snapshots are read, both payloads are
//! edited, and one transaction supersedes whichever sides changed. If either
//! side moved on in the meantime the transaction rolls back with `Conflict`
//! and the whole read-edit-write cycle runs again after a backoff delay.

use std::time::Duration;

use backon::Retryable;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::storage::{
    Payload, Result, Snapshot, SnapshotCollection, SqlDatabase, StorageClient, StoreError,
};
use crate::utils::retry::{is_retryable, RetryConfig};

/// One side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef<'a> {
    pub collection: &'a str,
    pub id: &'a str,
}

impl<'a> EntityRef<'a> {
    pub fn new(collection: &'a str, id: &'a str) -> Self {
        Self { collection, id }
    }
}

/// Result of a successful link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Both payloads already referenced each other; nothing was written.
    AlreadyLinked,
    /// New current snapshots for the sides that changed.
    Linked {
        left: Option<Snapshot>,
        right: Option<Snapshot>,
    },
}

/// Make `left` and `right` reference each other.
///
/// `link_left` and `link_right` edit the decoded payloads in place and
/// return whether they changed anything. They may run once per attempt, so
/// they must be idempotent. `NotFound`, `Integrity` and transport errors are
/// returned at once; `Conflict` is retried per `retry` and returned when the
/// retries run out.
pub async fn link<DB, L, R, FL, FR>(
    client: &StorageClient<DB>,
    left: EntityRef<'_>,
    right: EntityRef<'_>,
    retry: &RetryConfig,
    link_left: FL,
    link_right: FR,
) -> Result<LinkOutcome>
where
    DB: SqlDatabase,
    L: Serialize + DeserializeOwned + Send,
    R: Serialize + DeserializeOwned + Send,
    FL: Fn(&mut L) -> bool + Sync,
    FR: Fn(&mut R) -> bool + Sync,
{
    if left == right {
        return Err(StoreError::Integrity {
            collection: left.collection.to_string(),
            id: left.id.to_string(),
        });
    }

    let outcome = (|| link_once(client, left, right, &link_left, &link_right))
        .retry(retry.backoff())
        .when(is_retryable)
        .notify(|err: &StoreError, dur: Duration| {
            warn!(
                left = %left.id,
                right = %right.id,
                error = %err,
                delay = ?dur,
                "Link lost a concurrent update, retrying"
            );
        })
        .await?;

    match &outcome {
        LinkOutcome::AlreadyLinked => {
            debug!(left = %left.id, right = %right.id, "Entities already linked");
        }
        LinkOutcome::Linked { left: l, right: r } => {
            info!(
                left_collection = %left.collection,
                left = %left.id,
                right_collection = %right.collection,
                right = %right.id,
                left_written = l.is_some(),
                right_written = r.is_some(),
                "Entities linked"
            );
        }
    }
    Ok(outcome)
}

async fn link_once<DB, L, R, FL, FR>(
    client: &StorageClient<DB>,
    left: EntityRef<'_>,
    right: EntityRef<'_>,
    link_left: &FL,
    link_right: &FR,
) -> Result<LinkOutcome>
where
    DB: SqlDatabase,
    L: Serialize + DeserializeOwned + Send,
    R: Serialize + DeserializeOwned + Send,
    FL: Fn(&mut L) -> bool + Sync,
    FR: Fn(&mut R) -> bool + Sync,
{
    let left_current = client
        .collection(left.collection)
        .get_current_snapshot(left.id)
        .await?;
    let right_current = client
        .collection(right.collection)
        .get_current_snapshot(right.id)
        .await?;

    let mut left_doc: L = left_current.decode()?;
    let mut right_doc: R = right_current.decode()?;

    let left_payload = match link_left(&mut left_doc) {
        true => Some(Payload::encode(&left_doc)?),
        false => None,
    };
    let right_payload = match link_right(&mut right_doc) {
        true => Some(Payload::encode(&right_doc)?),
        false => None,
    };

    if left_payload.is_none() && right_payload.is_none() {
        return Ok(LinkOutcome::AlreadyLinked);
    }

    client
        .transaction(|scope| async move {
            let mut written_left = None;
            if let Some(payload) = left_payload {
                let collection = scope.collection(left.collection);
                written_left = Some(
                    collection
                        .add_after(left_current.snapshot_id(), left.id, payload)
                        .await?,
                );
            }

            let mut written_right = None;
            if let Some(payload) = right_payload {
                let collection = scope.collection(right.collection);
                written_right = Some(
                    collection
                        .add_after(right_current.snapshot_id(), right.id, payload)
                        .await?,
                );
            }

            Ok::<_, StoreError>(LinkOutcome::Linked {
                left: written_left,
                right: written_right,
            })
        })
        .await
}
