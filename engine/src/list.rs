//! The canonical list: the single ordered, deduplicated collection for one
//! list scope.
//!
//! This module holds the container and its indexes. The merge rules
//! (pages, change events, local mutations) live in [`crate::reconcile`].
//!
//! # Invariants
//!
//! - No two records share an `id`.
//! - No two records share a non-null `secondary_key`.
//! - Records are sorted by the kind's [`DisplayOrder`].

use crate::{
    newest_first, DisplayOrder, EntityKind, ListSnapshot, PageRequest, Record, RecordId, Result,
    SecondaryKey, SNAPSHOT_FORMAT_VERSION,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// An ordered, deduplicated list of records of one kind.
#[derive(Debug, Clone)]
pub struct CanonicalList {
    kind: EntityKind,
    order: DisplayOrder,
    /// Records in display order
    records: Vec<Record>,
    /// Primary id index
    ids: HashSet<RecordId>,
    /// Secondary key -> owning id
    secondary: HashMap<SecondaryKey, RecordId>,
    /// Ids removed by a delete event while a page was in flight or a local
    /// mutation of the id was pending. Cleared once neither holds.
    tombstones: HashSet<RecordId>,
    /// Ids touched by local mutations not yet confirmed or restored
    pending: HashMap<RecordId, usize>,
    page_in_flight: bool,
    /// Oldest record any merged page carried; marks the end of the loaded range
    boundary: Option<Record>,
    has_more: bool,
    next_offset: u64,
    pages_merged: usize,
}

impl CanonicalList {
    /// Create an empty list for a kind.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            order: kind.display_order(),
            records: Vec::new(),
            ids: HashSet::new(),
            secondary: HashMap::new(),
            tombstones: HashSet::new(),
            pending: HashMap::new(),
            page_in_flight: false,
            boundary: None,
            has_more: true,
            next_offset: 0,
            pages_merged: 0,
        }
    }

    /// Entity kind held by this list.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Display order of this list.
    pub fn order(&self) -> DisplayOrder {
        self.order
    }

    /// Records in display order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the list holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record with this id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Get a record by id.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.position_of(id).map(|pos| &self.records[pos])
    }

    /// Get a record by secondary key.
    pub fn get_by_secondary(&self, key: &str) -> Option<&Record> {
        self.secondary.get(key).and_then(|id| self.get(id))
    }

    /// Whether an id was removed by a delete event.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    /// Number of ids currently tombstoned.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Whether a page was requested with [`begin_page`](Self::begin_page)
    /// and not yet merged or cancelled.
    pub fn page_in_flight(&self) -> bool {
        self.page_in_flight
    }

    /// Whether more pages may exist remotely.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Number of pages merged so far.
    pub fn pages_merged(&self) -> usize {
        self.pages_merged
    }

    /// Offset the next page should be fetched from.
    ///
    /// Advances by the size of every merged page, plus one for every
    /// realtime insert landing inside the loaded range, and steps back one
    /// for every delete inside it, so offsets keep tracking the remote
    /// collection while it changes underneath.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Build the request for the next page.
    pub fn next_page_request(&self, page_size: u32) -> Result<PageRequest> {
        PageRequest::new(self.next_offset, page_size)
    }

    /// Build the request for the next page and mark it in flight.
    ///
    /// Until the page is merged or cancelled, delete events leave a
    /// tombstone so the page cannot revive what they removed. Only one page
    /// is expected in flight at a time.
    pub fn begin_page(&mut self, page_size: u32) -> Result<PageRequest> {
        let request = self.next_page_request(page_size)?;
        self.page_in_flight = true;
        Ok(request)
    }

    /// Build a request covering the whole loaded range from offset zero and
    /// mark it in flight. Merge the answer with
    /// [`resync`](CanonicalList::resync).
    pub fn begin_resync(&mut self, page_size: u32) -> Result<PageRequest> {
        let loaded = u32::try_from(self.next_offset).unwrap_or(u32::MAX);
        let request = PageRequest::new(0, loaded.max(page_size))?;
        self.page_in_flight = true;
        Ok(request)
    }

    /// The page requested by [`begin_page`](Self::begin_page) will never be
    /// merged.
    pub fn cancel_page(&mut self) {
        self.page_in_flight = false;
        self.prune_tombstones();
    }

    /// Copy the list into an immutable snapshot.
    pub fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            kind: self.kind,
            records: self.records.clone(),
            has_more: self.has_more,
            next_offset: self.next_offset,
        }
    }

    /// Drop everything and start over as if freshly created.
    pub fn clear(&mut self) {
        *self = CanonicalList::new(self.kind);
    }

    // ------------------------------------------------------------------
    // Internal primitives. Every structural change goes through these so
    // the indexes never drift from `records`.
    // ------------------------------------------------------------------

    pub(crate) fn position_of(&self, id: &str) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.records.iter().position(|r| r.id == id)
    }

    /// Find the element a record refers to: by id, then by secondary key.
    pub(crate) fn locate(&self, record: &Record) -> Option<usize> {
        self.position_of(&record.id).or_else(|| {
            record
                .secondary_key
                .as_ref()
                .and_then(|key| self.secondary.get(key))
                .and_then(|id| self.position_of(id))
        })
    }

    /// Owner of a secondary key, if any.
    pub(crate) fn secondary_owner(&self, key: &str) -> Option<&RecordId> {
        self.secondary.get(key)
    }

    /// Insert at the position that keeps the list sorted.
    ///
    /// Callers guarantee neither the id nor the secondary key is present.
    pub(crate) fn insert_sorted(&mut self, record: Record) {
        debug_assert!(!self.ids.contains(&record.id));
        debug_assert!(record
            .secondary_key
            .as_ref()
            .map_or(true, |k| !self.secondary.contains_key(k)));

        let order = self.order;
        let pos = self
            .records
            .partition_point(|r| order.compare(r, &record) == Ordering::Less);

        self.ids.insert(record.id.clone());
        if let Some(key) = &record.secondary_key {
            self.secondary.insert(key.clone(), record.id.clone());
        }
        self.records.insert(pos, record);
    }

    /// Remove a record that left the remote collection, stepping the offset
    /// back when it sat inside the loaded range. Returns whether it did.
    pub(crate) fn remove_counted(&mut self, pos: usize) -> (Record, bool) {
        let within = self.within_loaded(&self.records[pos]);
        let record = self.remove_at(pos);
        if within {
            self.shift_offset(-1);
        }
        (record, within)
    }

    pub(crate) fn remove_at(&mut self, pos: usize) -> Record {
        let record = self.records.remove(pos);
        self.ids.remove(&record.id);
        if let Some(key) = &record.secondary_key {
            if self.secondary.get(key) == Some(&record.id) {
                self.secondary.remove(key);
            }
        }
        record
    }

    /// Whether a record sorts inside the range covered by merged pages.
    ///
    /// Once the list is complete everything is inside it. Before that, a
    /// record older than the oldest record any page carried belongs to a
    /// page not yet fetched, even if a realtime insert put it in the list.
    pub(crate) fn within_loaded(&self, record: &Record) -> bool {
        if !self.has_more {
            return true;
        }
        self.boundary
            .as_ref()
            .is_some_and(|oldest| newest_first(record, oldest) != Ordering::Greater)
    }

    /// Remember a deleted id, but only while something could still revive
    /// it: a page requested before the delete, or a pending local mutation
    /// whose rollback would put it back.
    pub(crate) fn tombstone(&mut self, id: RecordId) {
        if self.page_in_flight || self.pending.contains_key(&id) {
            self.tombstones.insert(id);
        }
    }

    pub(crate) fn clear_tombstone(&mut self, id: &str) {
        self.tombstones.remove(id);
    }

    fn prune_tombstones(&mut self) {
        if !self.page_in_flight {
            let pending = &self.pending;
            self.tombstones.retain(|id| pending.contains_key(id));
        }
    }

    pub(crate) fn hold(&mut self, id: &str) {
        *self.pending.entry(id.to_owned()).or_default() += 1;
    }

    pub(crate) fn release(&mut self, id: &str) {
        let Some(count) = self.pending.get_mut(id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.pending.remove(id);
            if !self.page_in_flight {
                self.tombstones.remove(id);
            }
        }
    }

    pub(crate) fn record_page(&mut self, len: usize, oldest: Option<Record>, has_more: bool) {
        if let Some(oldest) = oldest {
            let further = self
                .boundary
                .as_ref()
                .map_or(true, |boundary| newest_first(&oldest, boundary) == Ordering::Greater);
            if further {
                self.boundary = Some(oldest);
            }
        }
        self.next_offset += len as u64;
        self.has_more = has_more;
        self.pages_merged += 1;
        self.page_in_flight = false;
        self.prune_tombstones();
    }

    /// Drop the records and paging state but keep what guards against
    /// revival: tombstones, pending ids and the in-flight page.
    pub(crate) fn reset_records(&mut self) {
        self.records.clear();
        self.ids.clear();
        self.secondary.clear();
        self.boundary = None;
        self.has_more = true;
        self.next_offset = 0;
        self.pages_merged = 0;
    }

    pub(crate) fn shift_offset(&mut self, delta: i64) {
        self.next_offset = self.next_offset.saturating_add_signed(delta);
    }

    pub(crate) fn record_mut(&mut self, pos: usize) -> &mut Record {
        &mut self.records[pos]
    }
}
