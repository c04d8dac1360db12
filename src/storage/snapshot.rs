//! Snapshot value types.
//!
//! A `Snapshot` is one immutable version of an entity. Its `SnapshotId` is
//! the optimistic concurrency token a caller presents to `add_after`.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Result;

/// Opaque, monotonically assigned version token (surrogate row key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(i64);

impl SnapshotId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for SnapshotId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialized entity document. The store never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Bytes);

impl Payload {
    /// Serialize a typed document as JSON.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Deserialize the document as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(value: &'static [u8]) -> Self {
        Self(Bytes::from_static(value))
    }
}

impl From<&'static str> for Payload {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

/// One immutable, timestamped version of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    entity_id: String,
    snapshot_id: SnapshotId,
    payload: Payload,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub(crate) fn new(
        entity_id: String,
        snapshot_id: SnapshotId,
        payload: Payload,
        valid_from: DateTime<Utc>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            entity_id,
            snapshot_id,
            payload,
            valid_from,
            valid_to,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    /// A snapshot without an end of validity represents "now".
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Deserialize the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload.decode()
    }
}

/// Generate a fresh entity identifier.
pub fn generate_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Process-clock write time, truncated to the microsecond precision both
/// backends keep. SQLite stamps snapshots with it.
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn commit_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
