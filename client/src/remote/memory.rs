//! In-process remote store.
//!
//! Backs demos and tests. Records live in a `DashMap`, changes fan out over
//! a broadcast channel, and faults can be injected to exercise the failure
//! paths of the reconciler and the mutation gateway.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crm_sync_engine::{
    newest_first, ChangeEvent, EntityKind, ListScope, Page, PageRequest, Record, RecordId,
};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, watch};

use super::{is_provisional, ChangeStream, ChangeSubscriber, PageFetcher, RemoteWriter};
use crate::error::RemoteError;

const FEED_CAPACITY: usize = 1024;

/// Holds calls back until released.
#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::Sender::new(true),
        }
    }

    fn hold(&self) {
        self.open.send_replace(false);
    }

    fn release(&self) {
        self.open.send_replace(true);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as the store, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// In-memory remote store with a broadcast change feed.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<(EntityKind, RecordId), Record>,
    feed: broadcast::Sender<(EntityKind, ChangeEvent)>,
    /// Bumped to end every open feed
    epoch: watch::Sender<u64>,
    fetch_gate: Gate,
    write_gate: Gate,
    failing_fetches: AtomicUsize,
    failing_subscribes: AtomicUsize,
    failing_writes: AtomicUsize,
    fetch_count: AtomicUsize,
    next_id: AtomicU64,
    clock: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            records: DashMap::new(),
            feed,
            epoch: watch::Sender::new(0),
            fetch_gate: Gate::new(),
            write_gate: Gate::new(),
            failing_fetches: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            fetch_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            clock: AtomicI64::new(0),
        }
    }

    /// Create an empty store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // ========================================================================
    // Server-side changes
    // ========================================================================

    /// Load records without emitting change events.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.records.insert((record.kind, record.id.clone()), record);
        }
    }

    /// Insert or replace a record as another client would, emitting `Inserted`.
    pub fn insert_remote(&self, record: Record) {
        self.records
            .insert((record.kind, record.id.clone()), record.clone());
        self.emit(record.kind, ChangeEvent::inserted(record));
    }

    /// Merge fields into a stored record, emitting `Updated`.
    pub fn update_remote(
        &self,
        kind: EntityKind,
        id: &str,
        fields: serde_json::Value,
    ) -> Option<Record> {
        let updated = {
            let mut entry = self.records.get_mut(&(kind, id.to_string()))?;
            let mut patch = entry.clone();
            patch.fields = fields;
            entry.merge_from(&patch);
            entry.clone()
        };
        self.emit(kind, ChangeEvent::updated(updated.clone()));
        Some(updated)
    }

    /// Delete a stored record, emitting `Deleted`.
    pub fn delete_remote(&self, kind: EntityKind, id: &str) -> bool {
        let removed = self.records.remove(&(kind, id.to_string())).is_some();
        if removed {
            self.emit(kind, ChangeEvent::deleted(id));
        }
        removed
    }

    /// Push a raw event onto the feed, bypassing storage.
    ///
    /// Used to replay duplicates or out-of-order deliveries.
    pub fn emit(&self, kind: EntityKind, event: ChangeEvent) {
        tracing::trace!(kind = %kind, id = %event.id(), "Emitting change event");
        // No receivers is fine: nobody is subscribed yet
        let _ = self.feed.send((kind, event));
    }

    /// A stored record.
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Record> {
        self.records
            .get(&(kind, id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Number of stored records of a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.records.iter().filter(|e| e.key().0 == kind).count()
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Fail the next `n` page fetches.
    pub fn fail_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` subscribe attempts.
    pub fn fail_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` writes.
    pub fn fail_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Hold page deliveries until [`release_fetches`](Self::release_fetches).
    pub fn hold_fetches(&self) {
        self.fetch_gate.hold();
    }

    pub fn release_fetches(&self) {
        self.fetch_gate.release();
    }

    /// Hold writes until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.write_gate.hold();
    }

    pub fn release_writes(&self) {
        self.write_gate.release();
    }

    /// End every open change feed, as a dropped connection would.
    pub fn drop_feeds(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Number of open change feeds.
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Number of page fetches served or attempted.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn tick(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let last = self.clock.fetch_max(now, Ordering::SeqCst);
        if last >= now {
            self.clock.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            now
        }
    }
}

/// Consume one injected fault, if any remain.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PageFetcher for MemoryStore {
    async fn fetch_page(
        &self,
        scope: &ListScope,
        request: PageRequest,
    ) -> Result<Page, RemoteError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let mut matching: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| scope.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(newest_first);

        let records = matching
            .into_iter()
            .skip(request.offset as usize)
            .take(request.probe_limit() as usize)
            .collect();

        // The page reflects the store when the request was made, even if
        // its delivery is held back
        self.fetch_gate.pass().await;
        if take_fault(&self.failing_fetches) {
            return Err(RemoteError::Network("injected fetch failure".into()));
        }

        Ok(Page::from_probe(records, &request))
    }
}

#[async_trait]
impl ChangeSubscriber for MemoryStore {
    async fn subscribe(&self, scope: &ListScope) -> Result<ChangeStream, RemoteError> {
        if take_fault(&self.failing_subscribes) {
            return Err(RemoteError::Network("injected subscribe failure".into()));
        }

        let kind = scope.kind;
        let receiver = self.feed.subscribe();
        let epoch = self.epoch.subscribe();

        let stream = futures::stream::unfold(
            (receiver, epoch),
            move |(mut receiver, mut epoch)| async move {
                loop {
                    tokio::select! {
                        _ = epoch.changed() => return None,
                        received = receiver.recv() => match received {
                            Ok((event_kind, event)) if event_kind == kind => {
                                return Some((Ok(event), (receiver, epoch)));
                            }
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                let err = RemoteError::Network(format!("feed lagged by {n} events"));
                                return Some((Err(err), (receiver, epoch)));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

#[async_trait]
impl RemoteWriter for MemoryStore {
    async fn update_fields(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<Record, RemoteError> {
        self.write_gate.pass().await;
        if take_fault(&self.failing_writes) {
            return Err(RemoteError::Rejected("injected write failure".into()));
        }
        if !fields.is_object() {
            return Err(RemoteError::Rejected("fields must be an object".into()));
        }

        self.update_remote(kind, id, fields.clone())
            .ok_or_else(|| RemoteError::Rejected(format!("{kind} {id} not found")))
    }

    async fn insert(&self, record: &Record) -> Result<Record, RemoteError> {
        self.write_gate.pass().await;
        if take_fault(&self.failing_writes) {
            return Err(RemoteError::Rejected("injected write failure".into()));
        }

        let mut stored = record.clone();
        if is_provisional(&stored.id) {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            stored.id = format!("{}-{}", stored.kind, n);
        }
        if stored.sort_key.is_none() {
            stored.sort_key = Some(self.tick());
        }

        if self.records.contains_key(&(stored.kind, stored.id.clone())) {
            return Err(RemoteError::Rejected(format!("duplicate id {}", stored.id)));
        }

        self.insert_remote(stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.write_gate.pass().await;
        if take_fault(&self.failing_writes) {
            return Err(RemoteError::Rejected("injected write failure".into()));
        }

        if self.delete_remote(kind, id) {
            Ok(())
        } else {
            Err(RemoteError::Rejected(format!("{kind} {id} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_sync_engine::ListFilter;
    use serde_json::json;

    fn scope() -> ListScope {
        ListScope::new(EntityKind::Contact, ListFilter::new())
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed((1..=5).map(|i| Record::contact(format!("c{i}"), i * 10, json!({"n": i}))));
        store
    }

    #[tokio::test]
    async fn test_pages_are_newest_first() {
        let store = seeded();

        let first = store
            .fetch_page(&scope(), PageRequest::new(0, 2).unwrap())
            .await
            .unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c5", "c4"]);
        assert!(first.has_more);

        let last = store
            .fetch_page(&scope(), PageRequest::new(4, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_fetch_applies_filter() {
        let store = MemoryStore::new();
        store.seed([
            Record::contact("a", 1, json!({"org_id": "A"})),
            Record::contact("b", 2, json!({"org_id": "B"})),
        ]);
        let scope = ListScope::new(EntityKind::Contact, ListFilter::new().with_eq("org_id", "A"));

        let page = store
            .fetch_page(&scope, PageRequest::new(0, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.records[0].id, "a");
    }

    #[tokio::test]
    async fn test_injected_fetch_failure_is_consumed() {
        let store = seeded();
        store.fail_fetches(1);

        let request = PageRequest::new(0, 2).unwrap();
        assert!(store.fetch_page(&scope(), request).await.is_err());
        assert!(store.fetch_page(&scope(), request).await.is_ok());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_feed_delivers_only_its_kind() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&scope()).await.unwrap();
        assert_eq!(store.subscriber_count(), 1);

        store.insert_remote(Record::message("m1", 1, json!({})));
        store.insert_remote(Record::contact("c1", 1, json!({})));

        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.id(), "c1");
    }

    #[tokio::test]
    async fn test_dropped_feed_ends_stream() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&scope()).await.unwrap();

        store.drop_feeds();
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_insert_assigns_server_id() {
        let store = MemoryStore::new();
        let draft = Record::new(
            EntityKind::Message,
            crate::remote::provisional_id(),
            None,
            json!({"content": "hi"}),
        );

        let stored = store.insert(&draft).await.unwrap();
        assert_eq!(stored.id, "message-1");
        assert!(stored.sort_key.is_some());
        assert!(store.get(EntityKind::Message, "message-1").is_some());
    }

    #[tokio::test]
    async fn test_writes_fail_on_demand() {
        let store = seeded();
        store.fail_writes(1);

        let err = store
            .update_fields(EntityKind::Contact, "c1", &json!({"n": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));

        let updated = store
            .update_fields(EntityKind::Contact, "c1", &json!({"n": 0}))
            .await
            .unwrap();
        assert_eq!(updated.fields["n"], 0);
    }
}
