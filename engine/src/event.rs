//! Change events and batch coalescing.
//!
//! Realtime notifications arrive as [`ChangeEvent`]s. Bursts are collected
//! into an [`EventBatch`], which collapses events for the same id into one
//! net change before the batch is applied to a list in a single step.
//!
//! # Coalescing rules
//!
//! | pending        | incoming   | net                         |
//! |----------------|------------|-----------------------------|
//! | -              | any        | incoming                    |
//! | Insert         | Ins/Upd    | Insert, fields merged       |
//! | Update         | Update     | Update, fields merged       |
//! | Update         | Insert     | Insert, fields merged       |
//! | Insert/Update  | Delete     | Delete                      |
//! | Delete         | Insert     | Replace (new record wins)   |
//! | Delete         | Update     | Delete                      |
//! | Replace        | Ins/Upd    | Replace, fields merged      |
//! | Replace        | Delete     | Delete                      |

use crate::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A row-level change observed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeEvent {
    /// A record was created
    Inserted { record: Record },
    /// A record was modified
    Updated { record: Record },
    /// A record was removed
    Deleted { id: RecordId },
}

impl ChangeEvent {
    /// Shorthand for an insert.
    pub fn inserted(record: Record) -> Self {
        ChangeEvent::Inserted { record }
    }

    /// Shorthand for an update.
    pub fn updated(record: Record) -> Self {
        ChangeEvent::Updated { record }
    }

    /// Shorthand for a delete.
    pub fn deleted(id: impl Into<RecordId>) -> Self {
        ChangeEvent::Deleted { id: id.into() }
    }

    /// The id this event concerns.
    pub fn id(&self) -> &RecordId {
        match self {
            ChangeEvent::Inserted { record } | ChangeEvent::Updated { record } => &record.id,
            ChangeEvent::Deleted { id } => id,
        }
    }
}

/// Net effect of all batched events for one id.
#[derive(Debug, Clone, PartialEq)]
pub enum NetChange {
    /// Insert (or update, if already present)
    Insert(Record),
    /// Update in place
    Update(Record),
    /// Remove the record
    Delete(RecordId),
    /// Drop whatever is held under this id, then insert the new record
    Replace(Record),
}

impl NetChange {
    /// The id this change concerns.
    pub fn id(&self) -> &RecordId {
        match self {
            NetChange::Insert(r) | NetChange::Update(r) | NetChange::Replace(r) => &r.id,
            NetChange::Delete(id) => id,
        }
    }

    fn absorb(self, event: ChangeEvent) -> NetChange {
        match (self, event) {
            (NetChange::Insert(mut r), ChangeEvent::Inserted { record })
            | (NetChange::Insert(mut r), ChangeEvent::Updated { record }) => {
                r.merge_from(&record);
                NetChange::Insert(r)
            }
            (NetChange::Update(mut r), ChangeEvent::Inserted { record }) => {
                r.merge_from(&record);
                NetChange::Insert(r)
            }
            (NetChange::Update(mut r), ChangeEvent::Updated { record }) => {
                r.merge_from(&record);
                NetChange::Update(r)
            }
            (NetChange::Replace(mut r), ChangeEvent::Inserted { record })
            | (NetChange::Replace(mut r), ChangeEvent::Updated { record }) => {
                r.merge_from(&record);
                NetChange::Replace(r)
            }
            (NetChange::Delete(_), ChangeEvent::Inserted { record }) => NetChange::Replace(record),
            (NetChange::Delete(id), ChangeEvent::Updated { .. }) => NetChange::Delete(id),
            (_, ChangeEvent::Deleted { id }) => NetChange::Delete(id),
        }
    }
}

impl From<ChangeEvent> for NetChange {
    fn from(event: ChangeEvent) -> Self {
        match event {
            ChangeEvent::Inserted { record } => NetChange::Insert(record),
            ChangeEvent::Updated { record } => NetChange::Update(record),
            ChangeEvent::Deleted { id } => NetChange::Delete(id),
        }
    }
}

/// Pending events collapsed per id, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    changes: Vec<NetChange>,
    index: HashMap<RecordId, usize>,
    received: usize,
}

impl EventBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event, collapsing it with any pending change for the same id.
    pub fn push(&mut self, event: ChangeEvent) {
        self.received += 1;
        match self.index.get(event.id()) {
            Some(&slot) => {
                let pending = std::mem::replace(
                    &mut self.changes[slot],
                    NetChange::Delete(RecordId::new()),
                );
                self.changes[slot] = pending.absorb(event);
            }
            None => {
                self.index.insert(event.id().clone(), self.changes.len());
                self.changes.push(event.into());
            }
        }
    }

    /// Number of distinct ids with a pending change.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of raw events pushed since the batch was created or drained.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Pending change for an id.
    pub fn get(&self, id: &str) -> Option<&NetChange> {
        self.index.get(id).map(|&slot| &self.changes[slot])
    }

    /// Take all pending changes, leaving the batch empty.
    pub fn drain(&mut self) -> Vec<NetChange> {
        self.index.clear();
        self.received = 0;
        std::mem::take(&mut self.changes)
    }

    /// Iterate over pending changes in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &NetChange> {
        self.changes.iter()
    }
}

impl FromIterator<ChangeEvent> for EventBatch {
    fn from_iter<I: IntoIterator<Item = ChangeEvent>>(iter: I) -> Self {
        let mut batch = EventBatch::new();
        for event in iter {
            batch.push(event);
        }
        batch
    }
}
