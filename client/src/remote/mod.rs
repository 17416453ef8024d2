//! Remote store boundary.
//!
//! The reconciler talks to the backing store through three narrow traits:
//! [`PageFetcher`] for offset pages, [`ChangeSubscriber`] for the realtime
//! feed, and [`RemoteWriter`] for the writes behind optimistic mutations.
//! [`MemoryStore`] implements all three in process; the Postgres adapter
//! lives in [`crate::db`].

mod memory;

pub use memory::*;

use async_trait::async_trait;
use crm_sync_engine::{ChangeEvent, EntityKind, ListScope, Page, PageRequest, Record};
use futures::stream::BoxStream;

use crate::error::RemoteError;

/// A live change feed. Dropping the stream unsubscribes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RemoteError>>;

/// Fetches one page of a scope, ordered newest first by sort key.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, scope: &ListScope, request: PageRequest)
        -> Result<Page, RemoteError>;
}

/// Opens a change feed for a scope.
///
/// A feed may deliver events of records outside the scope's filter; the
/// subscription pump narrows them before they reach a list.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn subscribe(&self, scope: &ListScope) -> Result<ChangeStream, RemoteError>;
}

/// Performs the remote half of a local mutation.
///
/// Each write returns the records as the server stored them.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Shallow-merge `fields` into an existing record.
    async fn update_fields(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<Record, RemoteError>;

    /// Create a record. The server may assign its id and sort key.
    async fn insert(&self, record: &Record) -> Result<Record, RemoteError>;

    /// Delete a record.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;
}

/// Anything that can back a reconciler end to end.
pub trait RemoteStore: PageFetcher + ChangeSubscriber + RemoteWriter {}

impl<T: PageFetcher + ChangeSubscriber + RemoteWriter> RemoteStore for T {}

/// Prefix of ids the client assigns before the server confirms a record.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Whether an id was assigned locally and still awaits a server id.
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// A fresh provisional id.
pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4())
}
