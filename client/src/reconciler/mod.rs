//! Reconciler: one canonical list kept in sync with a remote store.
//!
//! A [`Reconciler`] is a cheap, cloneable handle to a background task that
//! owns the list. The task fetches pages on request, keeps a change feed
//! open from the first load on, debounces change events into batches, and
//! publishes every new state as an immutable [`ListView`].
//!
//! Dropping the last handle stops the task and closes its feed.

mod actor;
mod view;

pub use view::{FeedStatus, ListView, Phase};

use std::sync::Arc;

use crm_sync_engine::{
    BatchReport, ListFilter, ListScope, LocalMutation, MergeReport, PageRequest,
    PendingMutationSnapshot, Record,
};
use tokio::sync::{mpsc, oneshot, watch};

use self::actor::{Actor, Command};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::remote::{ChangeSubscriber, PageFetcher};

/// What a `load_next_page` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged
    Merged(MergeReport),
    /// Another fetch was already in flight; nothing was requested
    AlreadyLoading,
    /// The list is complete; nothing was requested
    Exhausted,
    /// The list was reset while the fetch was in flight; its result is dropped
    Discarded,
}

/// A local mutation applied ahead of its remote write.
#[derive(Debug)]
pub(crate) struct PendingLocal {
    pub(crate) generation: u64,
    pub(crate) snapshot: PendingMutationSnapshot,
}

/// Handle to a running reconciler.
#[derive(Clone)]
pub struct Reconciler {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<Arc<ListView>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("scope", &self.view.borrow().scope)
            .finish()
    }
}

impl Reconciler {
    /// Start a reconciler backed by one store.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn<S>(store: Arc<S>, scope: ListScope, config: SyncConfig) -> Result<Self>
    where
        S: PageFetcher + ChangeSubscriber + 'static,
    {
        Self::spawn_with(store.clone(), store, scope, config)
    }

    /// Start a reconciler with separate page and change sources.
    pub fn spawn_with(
        fetcher: Arc<dyn PageFetcher>,
        subscriber: Arc<dyn ChangeSubscriber>,
        scope: ListScope,
        config: SyncConfig,
    ) -> Result<Self> {
        PageRequest::new(0, config.page_size)?;
        scope.filter.validate()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let (actor, inbox, view) = Actor::new(fetcher, subscriber, scope, config, rx);
        tokio::spawn(actor.run(inbox));

        Ok(Self { commands, view })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The latest published view.
    pub fn current(&self) -> Arc<ListView> {
        Arc::clone(&self.view.borrow())
    }

    /// Records in display order.
    pub fn get_current_list(&self) -> Vec<Record> {
        self.current().records().to_vec()
    }

    pub fn has_next_page(&self) -> bool {
        self.view.borrow().has_next_page()
    }

    /// A receiver notified on every published change.
    pub fn subscribe_view(&self) -> watch::Receiver<Arc<ListView>> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ListView) -> bool,
    ) -> Result<Arc<ListView>> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(|current| predicate(current.as_ref()))
            .await
            .map_err(|_| SyncError::Closed)?;
        Ok(Arc::clone(&matched))
    }

    // ========================================================================
    // Paging and lifecycle
    // ========================================================================

    /// Fetch and merge the next page.
    ///
    /// Returns without fetching when a fetch is already in flight or the
    /// list is complete. A failed fetch leaves the list unchanged.
    pub async fn load_next_page(&self) -> Result<LoadOutcome> {
        self.request(|reply| Command::LoadNextPage { reply })
            .await?
    }

    /// Drop all state and rebind to `filter`.
    ///
    /// Starts a new generation: in-flight fetches are discarded and the feed
    /// is closed until the next `load_next_page`.
    pub async fn reset(&self, filter: ListFilter) -> Result<()> {
        self.request(|reply| Command::Reset {
            filter: Some(filter),
            reply,
        })
        .await?
    }

    /// Drop all state and load the first page again under the same filter.
    pub async fn refresh(&self) -> Result<LoadOutcome> {
        self.request(|reply| Command::Reset {
            filter: None,
            reply,
        })
        .await??;
        self.load_next_page().await
    }

    /// Apply pending change events now instead of waiting out the debounce.
    pub async fn flush(&self) -> Result<BatchReport> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Stop the reconciler and close its feed.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    pub(crate) async fn apply_local(&self, mutation: LocalMutation) -> Result<PendingLocal> {
        self.request(|reply| Command::ApplyLocal { mutation, reply })
            .await?
    }

    /// Undo a local mutation. Returns false if the list was reset meanwhile.
    pub(crate) async fn rollback(&self, pending: PendingLocal) -> Result<bool> {
        self.request(|reply| Command::Rollback { pending, reply })
            .await
    }

    /// Replace a local mutation's records with the server's versions.
    pub(crate) async fn confirm(&self, pending: PendingLocal, records: Vec<Record>) -> Result<bool> {
        self.request(|reply| Command::Confirm {
            pending,
            records,
            reply,
        })
        .await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}
