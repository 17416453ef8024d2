//! # CRM Sync Client
//!
//! Async runtime around [`crm_sync_engine`]: keeps canonical lists in sync
//! with a remote store and applies optimistic mutations against them.
//!
//! - [`Reconciler`] owns one list. It fetches pages on demand, keeps a
//!   change feed open, debounces change events into batches and publishes
//!   each new state as a [`ListView`].
//! - [`MutationGateway`] applies local changes ahead of their remote writes
//!   and rolls them back when a write fails.
//! - [`remote`] defines the store boundary; [`MemoryStore`] implements it in
//!   process and [`db::PgRemoteStore`] on PostgreSQL.
//!
//! ```no_run
//! use crm_sync_client::{MemoryStore, MutationGateway, Reconciler, SyncConfig};
//! use crm_sync_engine::{EntityKind, ListFilter, ListScope};
//! use serde_json::json;
//!
//! # async fn demo() -> crm_sync_client::Result<()> {
//! let store = MemoryStore::new_shared();
//! let scope = ListScope::new(EntityKind::Contact, ListFilter::new().with_eq("org_id", "A"));
//!
//! let contacts = Reconciler::spawn(store.clone(), scope, SyncConfig::default())?;
//! contacts.load_next_page().await?;
//!
//! let gateway = MutationGateway::new(contacts.clone(), store);
//! gateway.append(json!({"org_id": "A", "name": "Ann"})).await?;
//!
//! for record in contacts.get_current_list() {
//!     println!("{} {}", record.id, record.fields["name"]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod reconciler;
pub mod remote;
mod subscription;

pub use config::{Config, ConfigError, RetryConfig, SyncConfig};
pub use error::{RemoteError, Result, SyncError};
pub use gateway::MutationGateway;
pub use reconciler::{FeedStatus, ListView, LoadOutcome, Phase, Reconciler};
pub use remote::{ChangeSubscriber, MemoryStore, PageFetcher, RemoteStore, RemoteWriter};

/// Install the tracing subscriber used by the binary and demos.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crm_sync_client=debug,crm_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
