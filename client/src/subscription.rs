//! Change feed pump.
//!
//! Owns one open feed for a scope on behalf of a reconciler generation.
//! Events are forwarded as they arrive; a dropped feed is reopened with
//! exponential backoff until the retry policy runs out. Events missed while
//! the feed was down are not replayed, so the reconciler re-reads its list
//! when an `Up` follows a `Down`.

use std::sync::Arc;

use crm_sync_engine::{CanonicalList, ChangeEvent, EventBatch, ListScope, NetChange};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::remote::ChangeSubscriber;

/// What a feed reports to its reconciler.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FeedSignal {
    /// The feed is open
    Up,
    /// A change in scope
    Event(ChangeEvent),
    /// The feed dropped; reconnecting after a delay
    Down { attempt: usize, reason: String },
    /// Reconnecting failed too often; the pump has stopped
    Lost { attempts: usize, reason: String },
}

/// Signal tagged with the generation of the feed that produced it.
pub(crate) type FeedSender = mpsc::UnboundedSender<(u64, FeedSignal)>;

/// An open change subscription. Dropping it closes the feed.
#[derive(Debug)]
pub(crate) struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn open(
        subscriber: Arc<dyn ChangeSubscriber>,
        scope: ListScope,
        generation: u64,
        retry: RetryConfig,
        signals: FeedSender,
    ) -> Self {
        tracing::debug!(scope = %scope, generation, "Opening change feed");
        let task = tokio::spawn(pump(subscriber, scope, generation, retry, signals));
        Self { task }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump(
    subscriber: Arc<dyn ChangeSubscriber>,
    scope: ListScope,
    generation: u64,
    retry: RetryConfig,
    signals: FeedSender,
) {
    let send = |signal: FeedSignal| signals.send((generation, signal)).is_ok();
    let mut failures = 0usize;

    loop {
        let reason = match subscriber.subscribe(&scope).await {
            Ok(mut stream) => {
                if !send(FeedSignal::Up) {
                    return;
                }
                let opened = Instant::now();
                let mut delivered = false;

                let reason = loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            delivered = true;
                            if !send(FeedSignal::Event(event)) {
                                return;
                            }
                        }
                        Some(Err(err)) => break err.to_string(),
                        None => break "change feed closed".to_string(),
                    }
                };

                // A feed that worked for a while starts a fresh retry budget
                if delivered || opened.elapsed() >= retry.max_delay {
                    failures = 0;
                }
                reason
            }
            Err(err) => err.to_string(),
        };

        failures += 1;
        if retry.exhausted(failures) {
            let attempts = failures - 1;
            tracing::error!(scope = %scope, attempts, reason = %reason, "Change feed lost");
            send(FeedSignal::Lost { attempts, reason });
            return;
        }

        let delay = retry.delay_for(failures);
        tracing::warn!(
            scope = %scope,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Change feed dropped, reconnecting"
        );
        if !send(FeedSignal::Down {
            attempt: failures,
            reason,
        }) {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

/// Maps raw feed events onto a filtered scope.
///
/// A record updated out of the filter is reported as deleted, but only if
/// the list could hold it. If it later matches again after its removal it
/// is reported as inserted so the list takes it back. Nothing is remembered
/// between events beyond what the list and the queued batch already hold.
pub(crate) struct ScopeNarrower<'a> {
    pub(crate) scope: &'a ListScope,
    pub(crate) list: &'a CanonicalList,
    pub(crate) queued: &'a EventBatch,
}

impl ScopeNarrower<'_> {
    pub(crate) fn apply(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        match event {
            ChangeEvent::Inserted { record } => self
                .scope
                .matches(&record)
                .then_some(ChangeEvent::Inserted { record }),
            ChangeEvent::Updated { record } if !self.scope.matches(&record) => {
                let held = record.kind == self.scope.kind && self.may_hold(&record.id);
                held.then(|| ChangeEvent::deleted(record.id))
            }
            ChangeEvent::Updated { record } => {
                if self.removed(&record.id) {
                    Some(ChangeEvent::Inserted { record })
                } else {
                    Some(ChangeEvent::Updated { record })
                }
            }
            deleted @ ChangeEvent::Deleted { .. } => Some(deleted),
        }
    }

    /// Held now, about to be by a queued change, or possibly on a page
    /// still in flight.
    fn may_hold(&self, id: &str) -> bool {
        self.list.contains(id)
            || self.list.page_in_flight()
            || matches!(self.queued.get(id), Some(change) if !matches!(change, NetChange::Delete(_)))
    }

    /// Removed by a delete the list still guards against, or by one queued.
    fn removed(&self, id: &str) -> bool {
        self.list.is_tombstoned(id) || matches!(self.queued.get(id), Some(NetChange::Delete(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_sync_engine::{EntityKind, ListFilter, Page, Record};
    use serde_json::json;

    fn contact(status: &str) -> Record {
        Record::contact("c1", 10, json!({"status": status}))
    }

    fn loaded(records: Vec<Record>) -> CanonicalList {
        let mut list = CanonicalList::new(EntityKind::Contact);
        list.merge_page(Page {
            records,
            has_more: true,
        })
        .unwrap();
        list
    }

    /// Narrow onto the "lead" contacts.
    fn narrow(list: &CanonicalList, queued: &EventBatch, event: ChangeEvent) -> Option<ChangeEvent> {
        let scope = ListScope::new(
            EntityKind::Contact,
            ListFilter::new().with_eq("status", "lead"),
        );
        let narrower = ScopeNarrower {
            scope: &scope,
            list,
            queued,
        };
        narrower.apply(event)
    }

    #[test]
    fn test_insert_outside_scope_is_dropped() {
        let list = loaded(Vec::new());
        let event = ChangeEvent::inserted(contact("client"));
        assert_eq!(narrow(&list, &EventBatch::new(), event), None);
    }

    #[test]
    fn test_update_out_of_scope_becomes_delete_then_reinsert() {
        let list = loaded(vec![contact("lead")]);
        let mut queued = EventBatch::new();

        assert_eq!(
            narrow(&list, &queued, ChangeEvent::updated(contact("client"))),
            Some(ChangeEvent::deleted("c1"))
        );
        queued.push(ChangeEvent::deleted("c1"));

        // Back in scope while the delete is still queued
        assert_eq!(
            narrow(&list, &queued, ChangeEvent::updated(contact("lead"))),
            Some(ChangeEvent::inserted(contact("lead")))
        );
    }

    #[test]
    fn test_in_scope_update_passes_through() {
        let list = loaded(vec![contact("lead")]);
        assert_eq!(
            narrow(&list, &EventBatch::new(), ChangeEvent::updated(contact("lead"))),
            Some(ChangeEvent::updated(contact("lead")))
        );
    }

    #[test]
    fn test_out_of_scope_churn_is_dropped() {
        let list = loaded(vec![Record::contact("mine", 50, json!({"status": "lead"}))]);
        let queued = EventBatch::new();

        for i in 0..100 {
            let other = Record::contact(format!("other-{i}"), 10, json!({"status": "client"}));
            assert_eq!(narrow(&list, &queued, ChangeEvent::updated(other)), None);
        }
    }

    #[test]
    fn test_out_of_scope_update_during_page_fetch_is_a_delete() {
        let mut list = loaded(Vec::new());
        list.begin_page(10).unwrap();

        // The page in flight may still carry the old in-scope version
        assert_eq!(
            narrow(&list, &EventBatch::new(), ChangeEvent::updated(contact("client"))),
            Some(ChangeEvent::deleted("c1"))
        );
    }

    #[test]
    fn test_other_kind_updates_are_dropped() {
        let mut list = loaded(Vec::new());
        list.begin_page(10).unwrap();

        let message = Record::message("m1", 1, json!({"status": "lead"}));
        assert_eq!(
            narrow(&list, &EventBatch::new(), ChangeEvent::updated(message)),
            None
        );
    }
}
