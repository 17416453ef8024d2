//! Record types and canonical ordering.

use crate::{Error, RecordId, SecondaryKey, SortKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The kind of entity a list holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A CRM contact (lead, client, ...)
    Contact,
    /// A chat message belonging to a conversation
    Message,
}

/// The order in which a list presents its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayOrder {
    /// Highest sort key first (contact boards)
    NewestFirst,
    /// Lowest sort key first (chat transcripts)
    OldestFirst,
}

impl EntityKind {
    /// Stable lowercase name, used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Message => "message",
        }
    }

    /// How lists of this kind are presented.
    ///
    /// Pages are always fetched newest-first; messages are then shown
    /// oldest to newest.
    pub fn display_order(&self) -> DisplayOrder {
        match self {
            EntityKind::Contact => DisplayOrder::NewestFirst,
            EntityKind::Message => DisplayOrder::OldestFirst,
        }
    }

    /// Field a free-text search matches against.
    pub fn search_field(&self) -> &'static str {
        match self {
            EntityKind::Contact => "name",
            EntityKind::Message => "content",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contact" | "contacts" => Ok(EntityKind::Contact),
            "message" | "messages" => Ok(EntityKind::Message),
            other => Err(Error::InvalidFilter(format!("unknown entity kind: {other}"))),
        }
    }
}

/// A record held in a canonical list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier assigned by the remote store
    pub id: RecordId,
    /// Entity kind of this record
    pub kind: EntityKind,
    /// Ordering timestamp (ms since epoch); `None` while the server has not assigned one
    #[serde(default)]
    pub sort_key: Option<SortKey>,
    /// Provider identifier used to dedupe the same record arriving over two channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<SecondaryKey>,
    /// Domain payload (JSON object)
    pub fields: serde_json::Value,
}

impl Record {
    /// Create a new record without a secondary key.
    pub fn new(
        kind: EntityKind,
        id: impl Into<RecordId>,
        sort_key: Option<SortKey>,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            sort_key,
            secondary_key: None,
            fields,
        }
    }

    /// Shorthand for a contact record.
    pub fn contact(id: impl Into<RecordId>, sort_key: SortKey, fields: serde_json::Value) -> Self {
        Self::new(EntityKind::Contact, id, Some(sort_key), fields)
    }

    /// Shorthand for a message record.
    pub fn message(id: impl Into<RecordId>, sort_key: SortKey, fields: serde_json::Value) -> Self {
        Self::new(EntityKind::Message, id, Some(sort_key), fields)
    }

    /// Attach a secondary key.
    pub fn with_secondary_key(mut self, key: impl Into<SecondaryKey>) -> Self {
        self.secondary_key = Some(key.into());
        self
    }

    /// Look up a top-level field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Check the payload is a JSON object.
    pub fn validate(&self) -> crate::Result<()> {
        if self.fields.is_object() {
            Ok(())
        } else {
            Err(Error::InvalidPayload(format!(
                "fields of {} must be an object",
                self.id
            )))
        }
    }

    /// Merge a newer version of this record into it.
    ///
    /// Incoming fields overwrite existing keys, keys absent from the
    /// incoming payload are kept. The id is never changed. Sort and
    /// secondary keys are taken from the incoming version when present.
    pub fn merge_from(&mut self, newer: &Record) {
        merge_fields(&mut self.fields, &newer.fields);
        if newer.sort_key.is_some() {
            self.sort_key = newer.sort_key;
        }
        if newer.secondary_key.is_some() {
            self.secondary_key = newer.secondary_key.clone();
        }
    }
}

/// Shallow-merge `patch` into `target`; non-object values replace wholesale.
pub(crate) fn merge_fields(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Compare two records in newest-first order.
///
/// Records without a sort key are newer than every keyed record. Equal sort
/// keys fall back to `id` ascending, which gives a total order because ids
/// are unique within a list.
pub fn newest_first(a: &Record, b: &Record) -> Ordering {
    let by_key = match (a.sort_key, b.sort_key) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    };
    by_key.then_with(|| a.id.cmp(&b.id))
}

impl DisplayOrder {
    /// Compare two records in this display order.
    ///
    /// `OldestFirst` is the exact reverse of `NewestFirst`, ties included.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        match self {
            DisplayOrder::NewestFirst => newest_first(a, b),
            DisplayOrder::OldestFirst => newest_first(b, a),
        }
    }
}
