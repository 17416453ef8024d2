//! # CRM Sync Engine
//!
//! A deterministic reconciliation core for paginated, realtime-updated lists.
//!
//! A CRM front-end shows lists (a contact board, a chat transcript) that are
//! fed from two directions at once: offset-based page fetches, and a realtime
//! change feed that keeps delivering inserts, updates and deletes while pages
//! are still loading. On top of that the user mutates records optimistically
//! before the backend confirms. This crate owns the rules that keep one such
//! list consistent through all of it.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never fetches, subscribes or sleeps
//! - **Deterministic**: the same sequence of inputs yields the same list
//! - **All-or-nothing**: a failed operation leaves the list untouched
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] has a unique `id`, an optional `sort_key` (null while the
//! server has not assigned one), an optional `secondary_key` used to dedupe
//! the same message arriving over two channels, and a JSON payload.
//!
//! ### Canonical List
//!
//! The [`CanonicalList`] holds records of one [`EntityKind`], sorted per the
//! kind's [`DisplayOrder`], with no duplicate ids or secondary keys.
//!
//! ### Change Events
//!
//! [`ChangeEvent`]s are collected into an [`EventBatch`], which collapses
//! events per id before the batch is applied in one step.
//!
//! ### Local Mutations
//!
//! A [`LocalMutation`] is applied ahead of its remote write and returns a
//! [`PendingMutationSnapshot`] that undoes exactly what it changed. The
//! snapshot goes back to the list once the write resolves: restored on
//! failure, confirmed with the server's records on success.
//!
//! ## Quick Start
//!
//! ```rust
//! use crm_sync_engine::{CanonicalList, ChangeEvent, EntityKind, Page, Record};
//! use serde_json::json;
//!
//! let mut list = CanonicalList::new(EntityKind::Contact);
//!
//! // 1. Merge the first page
//! let page = Page {
//!     records: vec![
//!         Record::contact("1", 100, json!({"name": "Ann"})),
//!         Record::contact("2", 90, json!({"name": "Bob"})),
//!     ],
//!     has_more: false,
//! };
//! list.merge_page(page).unwrap();
//!
//! // 2. A realtime insert lands at its sorted position
//! list.apply_event(ChangeEvent::inserted(Record::contact("3", 120, json!({"name": "Cy"}))));
//!
//! let ids: Vec<_> = list.records().iter().map(|r| r.id.as_str()).collect();
//! assert_eq!(ids, vec!["3", "1", "2"]);
//! ```

pub mod error;
pub mod event;
pub mod filter;
pub mod list;
pub mod mutation;
pub mod page;
pub mod reconcile;
pub mod record;
pub mod snapshot;

// Re-export main types at crate root
pub use error::{Error, Result};
pub use event::{ChangeEvent, EventBatch, NetChange};
pub use filter::{ListFilter, ListScope};
pub use list::CanonicalList;
pub use mutation::LocalMutation;
pub use page::{Page, PageRequest};
pub use reconcile::{Applied, BatchReport, MergeReport};
pub use record::{newest_first, DisplayOrder, EntityKind, Record};
pub use snapshot::{ListSnapshot, PendingMutationSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type RecordId = String;
pub type SecondaryKey = String;
pub type SortKey = i64;
