//! Snapshot types.
//!
//! Two kinds of snapshot exist:
//!
//! - [`PendingMutationSnapshot`]: the prior value of every record a local
//!   mutation touched, and nothing else. Restoring it puts exactly those
//!   records back, so a rollback never undoes an unrelated mutation or event
//!   applied in the meantime. It is never persisted.
//! - [`ListSnapshot`]: an immutable, serializable copy of a whole list, handed
//!   to readers so they never observe a list mid-update.

use crate::{EntityKind, Error, Record, RecordId, Result};
use serde::{Deserialize, Serialize};

/// Version of the list snapshot format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Prior state of the records touched by one local mutation.
///
/// Created when the mutation is applied, consumed by exactly one of
/// restore (remote write failed) or confirm (remote write succeeded) on the
/// list it came from. Discard it only once that list has been cleared.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "a pending snapshot must be restored or confirmed"]
pub struct PendingMutationSnapshot {
    prior: Vec<(RecordId, Option<Record>)>,
    provisional: Option<RecordId>,
    /// The mutation stepped the list's next offset back by one
    shifted_offset: bool,
}

impl PendingMutationSnapshot {
    pub(crate) fn new(
        prior: Vec<(RecordId, Option<Record>)>,
        provisional: Option<RecordId>,
    ) -> Self {
        Self {
            prior,
            provisional,
            shifted_offset: false,
        }
    }

    pub(crate) fn with_shifted_offset(mut self, shifted: bool) -> Self {
        self.shifted_offset = shifted;
        self
    }

    pub(crate) fn shifted_offset(&self) -> bool {
        self.shifted_offset
    }

    /// Ids whose prior value this snapshot holds.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.prior.iter().map(|(id, _)| id)
    }

    /// Prior value of a record; `Some(None)` if it was absent before.
    pub fn prior(&self, id: &str) -> Option<Option<&Record>> {
        self.prior
            .iter()
            .find(|(prior_id, _)| prior_id == id)
            .map(|(_, record)| record.as_ref())
    }

    /// Id of the record inserted locally, if the mutation inserted one.
    pub fn provisional(&self) -> Option<&RecordId> {
        self.provisional.as_ref()
    }

    /// Drop a snapshot whose list was cleared before the write resolved.
    pub fn discard(self) {}

    pub(crate) fn into_prior(self) -> Vec<(RecordId, Option<Record>)> {
        self.prior
    }
}

/// A point-in-time copy of a canonical list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Entity kind of the list
    pub kind: EntityKind,
    /// Records in display order
    pub records: Vec<Record>,
    /// Whether more pages may exist
    pub has_more: bool,
    /// Offset the next page will be fetched from
    pub next_offset: u64,
}

impl ListSnapshot {
    /// An empty snapshot for a kind.
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            kind,
            records: Vec::new(),
            has_more: true,
            next_offset: 0,
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Find a record by id.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Ids in display order.
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidPayload(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidPayload(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
