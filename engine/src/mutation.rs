//! Local mutations applied ahead of their remote write.

use crate::{Record, RecordId};
use serde::{Deserialize, Serialize};

/// A change applied to a list ahead of its remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LocalMutation {
    /// Merge fields into an existing record (e.g. move a contact to another status)
    Patch {
        id: RecordId,
        fields: serde_json::Value,
    },
    /// Add a record not yet known to the server (e.g. an outgoing message)
    Insert { record: Record },
    /// Drop a record from the list
    Remove { id: RecordId },
}

impl LocalMutation {
    /// Shorthand for a patch.
    pub fn patch(id: impl Into<RecordId>, fields: serde_json::Value) -> Self {
        LocalMutation::Patch {
            id: id.into(),
            fields,
        }
    }

    /// Shorthand for an insert.
    pub fn insert(record: Record) -> Self {
        LocalMutation::Insert { record }
    }

    /// Shorthand for a remove.
    pub fn remove(id: impl Into<RecordId>) -> Self {
        LocalMutation::Remove { id: id.into() }
    }

    /// The record this mutation targets.
    pub fn target(&self) -> &RecordId {
        match self {
            LocalMutation::Patch { id, .. } | LocalMutation::Remove { id } => id,
            LocalMutation::Insert { record } => &record.id,
        }
    }
}
