//! Unified error handling for the sync client.
//!
//! [`RemoteError`] is what remote store adapters return. [`SyncError`] is
//! what consumers of a reconciler see; every variant leaves the canonical
//! list in its last consistent state.

/// Failure reported by a remote store adapter.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Error surfaced to reconciler consumers.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A page fetch failed; the list is unchanged and the call may be retried.
    #[error("Page fetch failed: {0}")]
    FetchFailure(#[source] RemoteError),

    /// The change feed could not be reopened; call `refresh` to resync.
    #[error("Change feed dropped after {attempts} attempts: {reason}")]
    SubscriptionDropped { attempts: usize, reason: String },

    /// A remote write failed and its local change was rolled back.
    #[error("Remote write failed, local change rolled back: {0}")]
    MutationFailure(#[source] RemoteError),

    #[error("Engine error: {0}")]
    Engine(#[from] crm_sync_engine::Error),

    /// The reconciler has shut down.
    #[error("Reconciler closed")]
    Closed,
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::FetchFailure(RemoteError::Network("timeout".into()));
        assert_eq!(err.to_string(), "Page fetch failed: Network error: timeout");

        let err = SyncError::SubscriptionDropped {
            attempts: 5,
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Change feed dropped after 5 attempts: connection reset"
        );

        let err: SyncError = crm_sync_engine::Error::RecordNotFound("c-1".into()).into();
        assert_eq!(err.to_string(), "Engine error: record not found: c-1");
    }
}
