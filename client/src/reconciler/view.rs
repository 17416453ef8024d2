//! The published, read-only state of a reconciler.

use crm_sync_engine::{ListScope, ListSnapshot, Record};
use serde::Serialize;

use crate::error::SyncError;

/// Lifecycle of a reconciled list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// No page merged and no fetch in flight
    Empty,
    /// The first page is being fetched; change events are queued
    Loading,
    /// At least one page merged; change events are applied
    Ready,
}

/// Health of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FeedStatus {
    /// No feed opened for this generation yet
    Closed,
    Connecting,
    Live,
    /// Dropped and waiting to reconnect
    Reconnecting { attempt: usize, reason: String },
    /// Reconnecting gave up; the list only catches up on refresh
    Lost { attempts: usize, reason: String },
}

/// Snapshot of a reconciler as consumers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListView {
    /// Scope the list is bound to
    pub scope: ListScope,
    /// Bumped on every reset
    pub generation: u64,
    pub phase: Phase,
    /// Whether a page fetch is in flight
    pub loading: bool,
    pub feed: FeedStatus,
    /// Records in display order plus paging state
    pub list: ListSnapshot,
}

impl ListView {
    /// Records in display order.
    pub fn records(&self) -> &[Record] {
        &self.list.records
    }

    /// Ids in display order.
    pub fn ids(&self) -> Vec<&str> {
        self.list.ids()
    }

    pub fn has_next_page(&self) -> bool {
        self.list.has_more
    }

    /// Whether the list no longer receives realtime changes.
    pub fn is_degraded(&self) -> bool {
        matches!(self.feed, FeedStatus::Lost { .. })
    }

    /// The feed failure as an error, once reconnecting has given up.
    pub fn feed_error(&self) -> Option<SyncError> {
        match &self.feed {
            FeedStatus::Lost { attempts, reason } => Some(SyncError::SubscriptionDropped {
                attempts: *attempts,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}
