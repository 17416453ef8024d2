//! Optimistic mutation gateway.
//!
//! A mutation is applied to the local list first, then written remotely.
//! Success swaps in the server's version of the records; failure restores
//! exactly what the mutation changed and reports the error.
//!
//! Mutations on the same record run one after another, so the second one
//! snapshots the list as the first left it. Mutations on different records
//! run concurrently.
//!
//! Each mutation runs on its own task. A caller that stops waiting (a
//! timeout, a dropped request) leaves the write to finish and still gets
//! its local change confirmed or rolled back.

use std::future::Future;
use std::sync::Arc;

use crm_sync_engine::{LocalMutation, Record, RecordId};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{RemoteError, Result, SyncError};
use crate::reconciler::Reconciler;
use crate::remote::{provisional_id, RemoteWriter};

/// Per-record locks, removed again once nobody waits on them.
#[derive(Debug, Default)]
struct RecordLocks {
    locks: DashMap<RecordId, Arc<Mutex<()>>>,
}

impl RecordLocks {
    fn get(&self, id: &RecordId) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(id.clone()).or_default())
    }

    fn release(&self, id: &RecordId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Applies local mutations to a reconciler ahead of their remote writes.
#[derive(Clone)]
pub struct MutationGateway {
    reconciler: Reconciler,
    writer: Arc<dyn RemoteWriter>,
    locks: Arc<RecordLocks>,
}

impl std::fmt::Debug for MutationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationGateway")
            .field("reconciler", &self.reconciler)
            .field("busy_records", &self.locks.len())
            .finish()
    }
}

impl MutationGateway {
    /// Create a gateway writing through `writer`.
    pub fn new(reconciler: Reconciler, writer: Arc<dyn RemoteWriter>) -> Self {
        Self {
            reconciler,
            writer,
            locks: Arc::new(RecordLocks::default()),
        }
    }

    /// The reconciler this gateway mutates.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Apply `mutation` locally, then run `remote_write`.
    ///
    /// On success the records returned by the write replace the local
    /// versions and are returned. On failure the local change is rolled back
    /// and [`SyncError::MutationFailure`] is returned. A mutation the list
    /// cannot apply fails before any remote call is made.
    ///
    /// Dropping the returned future does not cancel the mutation.
    pub async fn mutate<F, Fut>(&self, mutation: LocalMutation, remote_write: F) -> Result<Vec<Record>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Vec<Record>, RemoteError>> + Send + 'static,
    {
        let gateway = self.clone();
        let task = tokio::spawn(async move {
            let target = mutation.target().clone();
            let lock = gateway.locks.get(&target);
            let result = {
                let _guard = lock.lock().await;
                gateway.run(mutation, remote_write).await
            };
            drop(lock);
            gateway.locks.release(&target);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SyncError::Closed),
        }
    }

    async fn run<F, Fut>(&self, mutation: LocalMutation, remote_write: F) -> Result<Vec<Record>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Record>, RemoteError>>,
    {
        let target = mutation.target().clone();
        let pending = self.reconciler.apply_local(mutation).await?;

        match remote_write().await {
            Ok(records) => {
                tracing::debug!(id = %target, confirmed = records.len(), "Remote write confirmed");
                self.reconciler.confirm(pending, records.clone()).await?;
                Ok(records)
            }
            Err(err) => {
                tracing::warn!(id = %target, error = %err, "Remote write failed, rolling back");
                self.reconciler.rollback(pending).await?;
                Err(SyncError::MutationFailure(err))
            }
        }
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    /// Shallow-merge `fields` into a record (a status move, a rename).
    pub async fn set_fields(&self, id: &str, fields: serde_json::Value) -> Result<Record> {
        let kind = self.reconciler.current().scope.kind;
        let writer = Arc::clone(&self.writer);
        let patch = fields.clone();
        let owned_id = id.to_string();

        let mut confirmed = self
            .mutate(LocalMutation::patch(id, fields), move || async move {
                writer
                    .update_fields(kind, &owned_id, &patch)
                    .await
                    .map(|record| vec![record])
            })
            .await?;
        confirmed
            .pop()
            .ok_or_else(|| SyncError::MutationFailure(RemoteError::Decode("empty write result".into())))
    }

    /// Add a new record under a provisional id.
    ///
    /// The record shows up at once; the server's version replaces it when
    /// the write succeeds.
    pub async fn append(&self, fields: serde_json::Value) -> Result<Record> {
        let kind = self.reconciler.current().scope.kind;
        self.insert(Record::new(kind, provisional_id(), None, fields))
            .await
    }

    /// Add a fully formed record.
    pub async fn insert(&self, record: Record) -> Result<Record> {
        let writer = Arc::clone(&self.writer);
        let draft = record.clone();

        let mut confirmed = self
            .mutate(LocalMutation::insert(record), move || async move {
                writer.insert(&draft).await.map(|record| vec![record])
            })
            .await?;
        confirmed
            .pop()
            .ok_or_else(|| SyncError::MutationFailure(RemoteError::Decode("empty write result".into())))
    }

    /// Delete a record.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let kind = self.reconciler.current().scope.kind;
        let writer = Arc::clone(&self.writer);
        let owned_id = id.to_string();

        self.mutate(LocalMutation::remove(id), move || async move {
            writer.delete(kind, &owned_id).await.map(|_| Vec::new())
        })
        .await?;
        Ok(())
    }

    /// Number of records with a mutation in flight or queued.
    pub fn busy_records(&self) -> usize {
        self.locks.len()
    }
}
