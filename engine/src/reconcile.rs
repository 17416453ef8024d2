//! Reconciliation rules for the canonical list.
//!
//! Three inputs feed a list, and all of them funnel through here:
//!
//! 1. Pages fetched by offset, merged with dedup against records already
//!    held (realtime may have delivered them first).
//! 2. Change events, applied singly or as a coalesced batch. An insert for
//!    a record already present (by id or secondary key) is an update.
//! 3. Local mutations, applied ahead of their remote write, which return a
//!    snapshot of exactly the records they touched so they can be undone.
//!
//! Every operation either completes fully or leaves the list untouched.

use crate::list::CanonicalList;
use crate::record::merge_fields;
use crate::{
    newest_first, ChangeEvent, Error, LocalMutation, NetChange, Page, PendingMutationSnapshot,
    Record, RecordId, Result,
};
use serde::{Deserialize, Serialize};

/// Outcome of merging one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Records added to the list
    pub added: usize,
    /// Records skipped because they were already present or deleted
    pub skipped: usize,
    /// Whether more pages may exist
    pub has_more: bool,
}

/// What applying one change did to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new record was added
    Inserted,
    /// An existing record was merged
    Updated,
    /// A record was removed
    Removed,
    /// Nothing changed
    Ignored,
}

/// Tally of one batch application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub ignored: usize,
}

impl BatchReport {
    fn count(&mut self, applied: Applied) {
        match applied {
            Applied::Inserted => self.inserted += 1,
            Applied::Updated => self.updated += 1,
            Applied::Removed => self.removed += 1,
            Applied::Ignored => self.ignored += 1,
        }
    }

    /// Whether the batch changed the list at all.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.removed > 0
    }
}

impl CanonicalList {
    fn check_record(&self, record: &Record) -> Result<()> {
        if record.kind != self.kind() {
            return Err(Error::KindMismatch {
                expected: self.kind(),
                got: record.kind,
            });
        }
        record.validate()
    }

    /// Merge a fetched page.
    ///
    /// Records whose id or secondary key is already held, or whose id was
    /// deleted by a change event, are skipped. The rest are inserted at
    /// their sorted position, so a page overlapping records delivered in
    /// realtime still yields a sorted list. A page holding a record of the
    /// wrong kind or a malformed payload is rejected whole, and a page begun
    /// with [`begin_page`](CanonicalList::begin_page) then stays in flight
    /// until cancelled.
    pub fn merge_page(&mut self, page: Page) -> Result<MergeReport> {
        for record in &page.records {
            self.check_record(record)?;
        }

        let fetched = page.records.len();
        let oldest = page.records.iter().max_by(|a, b| newest_first(a, b)).cloned();
        let mut report = MergeReport {
            has_more: page.has_more,
            ..MergeReport::default()
        };

        for record in page.records {
            let taken = self.contains(&record.id)
                || self.is_tombstoned(&record.id)
                || record
                    .secondary_key
                    .as_deref()
                    .is_some_and(|key| self.secondary_owner(key).is_some());
            if taken {
                report.skipped += 1;
            } else {
                self.insert_sorted(record);
                report.added += 1;
            }
        }

        self.record_page(fetched, oldest, page.has_more);
        Ok(report)
    }

    /// Replace the loaded range with one freshly fetched from offset zero.
    ///
    /// For when change events may have been missed: the page supersedes
    /// every record held. Ids deleted while it was in flight stay out, and
    /// pending local mutations can still be confirmed or restored.
    pub fn resync(&mut self, page: Page) -> Result<MergeReport> {
        for record in &page.records {
            self.check_record(record)?;
        }
        self.reset_records();
        self.merge_page(page)
    }

    /// Apply one change event.
    ///
    /// Events that cannot belong to this list (wrong kind, malformed
    /// payload) are ignored rather than failing the caller.
    pub fn apply_event(&mut self, event: ChangeEvent) -> Applied {
        match event {
            ChangeEvent::Inserted { record } => self.upsert(record, true),
            ChangeEvent::Updated { record } => self.upsert(record, false),
            ChangeEvent::Deleted { id } => self.delete(id),
        }
    }

    /// Apply the net changes of a drained batch in one step.
    pub fn apply_batch(&mut self, changes: impl IntoIterator<Item = NetChange>) -> BatchReport {
        let mut report = BatchReport::default();
        for change in changes {
            let applied = match change {
                NetChange::Insert(record) => self.upsert(record, true),
                NetChange::Update(record) => self.upsert(record, false),
                NetChange::Delete(id) => self.delete(id),
                NetChange::Replace(record) => {
                    if let Some(pos) = self.position_of(&record.id) {
                        self.remove_counted(pos);
                    }
                    self.upsert(record, true)
                }
            };
            report.count(applied);
        }
        report
    }

    fn upsert(&mut self, record: Record, inserted: bool) -> Applied {
        if self.check_record(&record).is_err() {
            return Applied::Ignored;
        }
        if inserted {
            self.clear_tombstone(&record.id);
        }

        if let Some(pos) = self.locate(&record) {
            let mut merged = self.remove_at(pos);
            merged.merge_from(&record);
            // The merged secondary key may now collide with another element;
            // both describe the same remote record, keep the merged one.
            if let Some(key) = merged.secondary_key.clone() {
                if let Some(pos) = self
                    .secondary_owner(&key)
                    .cloned()
                    .and_then(|owner| self.position_of(&owner))
                {
                    self.remove_counted(pos);
                }
            }
            self.insert_sorted(merged);
            return Applied::Updated;
        }

        if !inserted && (self.is_tombstoned(&record.id) || !self.within_loaded(&record)) {
            // Outside the loaded range a later page will bring it
            return Applied::Ignored;
        }

        let within = self.within_loaded(&record);
        self.insert_sorted(record);
        if within {
            self.shift_offset(1);
        }
        Applied::Inserted
    }

    fn delete(&mut self, id: RecordId) -> Applied {
        let applied = match self.position_of(&id) {
            Some(pos) => {
                self.remove_counted(pos);
                Applied::Removed
            }
            None => Applied::Ignored,
        };
        self.tombstone(id);
        applied
    }

    /// Apply a local mutation and return the snapshot that undoes it.
    ///
    /// Fails without touching the list when the mutation cannot apply: a
    /// patch of an absent record, an insert colliding with a held id or
    /// secondary key, or a payload of the wrong shape.
    pub fn apply_local(&mut self, mutation: LocalMutation) -> Result<PendingMutationSnapshot> {
        match mutation {
            LocalMutation::Patch { id, fields } => {
                if !fields.is_object() {
                    return Err(Error::InvalidPayload(format!(
                        "patch for {id} must be an object"
                    )));
                }
                let pos = self
                    .position_of(&id)
                    .ok_or_else(|| Error::RecordNotFound(id.clone()))?;
                let prior = self.records()[pos].clone();
                merge_fields(&mut self.record_mut(pos).fields, &fields);
                self.hold(&id);
                Ok(PendingMutationSnapshot::new(vec![(id, Some(prior))], None))
            }
            LocalMutation::Insert { record } => {
                self.check_record(&record)?;
                if self.contains(&record.id) {
                    return Err(Error::DuplicateRecord(record.id));
                }
                if let Some(owner) = record
                    .secondary_key
                    .as_deref()
                    .and_then(|key| self.secondary_owner(key))
                {
                    return Err(Error::DuplicateRecord(owner.clone()));
                }
                let id = record.id.clone();
                self.insert_sorted(record);
                self.hold(&id);
                Ok(PendingMutationSnapshot::new(
                    vec![(id.clone(), None)],
                    Some(id),
                ))
            }
            LocalMutation::Remove { id } => {
                // Counted like a remote delete: the echo of our own write finds
                // nothing left to remove.
                let (prior, shifted) = match self.position_of(&id) {
                    Some(pos) => {
                        let (record, shifted) = self.remove_counted(pos);
                        (Some(record), shifted)
                    }
                    None => (None, false),
                };
                self.hold(&id);
                Ok(PendingMutationSnapshot::new(vec![(id, prior)], None).with_shifted_offset(shifted))
            }
        }
    }

    /// Undo a local mutation.
    ///
    /// Each touched record is put back to its prior value, or removed if it
    /// did not exist before. Records the snapshot does not name are left
    /// alone. A prior value is not revived if a delete event removed its id
    /// meanwhile, or if its secondary key now belongs to another record.
    pub fn restore(&mut self, snapshot: PendingMutationSnapshot) {
        let shifted = snapshot.shifted_offset();
        for (id, prior) in snapshot.into_prior() {
            if let Some(pos) = self.position_of(&id) {
                self.remove_at(pos);
            }
            let revive = prior.filter(|prior| {
                !self.is_tombstoned(&id)
                    && !prior
                        .secondary_key
                        .as_deref()
                        .is_some_and(|key| self.secondary_owner(key).is_some())
            });
            if let Some(prior) = revive {
                self.insert_sorted(prior);
                if shifted {
                    self.shift_offset(1);
                }
            }
            self.release(&id);
        }
    }

    /// Fold the server's canonical records into the list after a confirmed
    /// write.
    ///
    /// A provisional record the server answered under a different id is
    /// replaced by the confirmed one.
    pub fn confirm(
        &mut self,
        snapshot: PendingMutationSnapshot,
        confirmed: Vec<Record>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        if let Some(provisional) = snapshot.provisional() {
            let kept = confirmed.iter().any(|r| &r.id == provisional);
            if !kept {
                if let Some(pos) = self.position_of(provisional) {
                    self.remove_at(pos);
                    report.removed += 1;
                }
            }
        }
        for id in snapshot.into_prior().into_iter().map(|(id, _)| id) {
            self.release(&id);
        }
        for record in confirmed {
            let applied = self.upsert(record, true);
            report.count(applied);
        }
        report
    }
}
