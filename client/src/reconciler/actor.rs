//! The task that owns a canonical list.
//!
//! All list state lives in one task. Consumers, page fetches and the change
//! feed talk to it over channels, so every change to the list is applied in
//! a single, ordered stream and published as a fresh [`ListView`].
//!
//! When the feed comes back after dropping, events from the gap are gone,
//! so the loaded range is fetched again from offset zero and replaces the
//! list. Events arriving meanwhile are queued and applied on top.

use std::sync::Arc;

use crm_sync_engine::{
    BatchReport, CanonicalList, EventBatch, ListFilter, ListScope, LocalMutation, Page,
    PageRequest, Record,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::view::{FeedStatus, ListView, Phase};
use super::{LoadOutcome, PendingLocal};
use crate::config::SyncConfig;
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::{ChangeSubscriber, PageFetcher};
use crate::subscription::{FeedSignal, FeedSender, ScopeNarrower, Subscription};

/// Requests from reconciler handles.
pub(crate) enum Command {
    LoadNextPage {
        reply: oneshot::Sender<Result<LoadOutcome>>,
    },
    Reset {
        filter: Option<ListFilter>,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<BatchReport>,
    },
    ApplyLocal {
        mutation: LocalMutation,
        reply: oneshot::Sender<Result<PendingLocal>>,
    },
    Rollback {
        pending: PendingLocal,
        reply: oneshot::Sender<bool>,
    },
    Confirm {
        pending: PendingLocal,
        records: Vec<Record>,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// A page fetch result tagged with the generation and fetch that issued it.
pub(crate) struct Fetched {
    generation: u64,
    seq: u64,
    result: std::result::Result<Page, RemoteError>,
}

struct InFlight {
    seq: u64,
    /// Absent for a resync nobody asked for
    reply: Option<oneshot::Sender<Result<LoadOutcome>>>,
    resync: bool,
}

pub(crate) struct Actor {
    scope: ListScope,
    config: SyncConfig,
    list: CanonicalList,
    generation: u64,
    pending: EventBatch,
    flush_at: Option<Instant>,
    fetch_seq: u64,
    in_flight: Option<InFlight>,
    feed: FeedStatus,
    subscription: Option<Subscription>,
    fetcher: Arc<dyn PageFetcher>,
    subscriber: Arc<dyn ChangeSubscriber>,
    fetch_tx: mpsc::UnboundedSender<Fetched>,
    feed_tx: FeedSender,
    view_tx: watch::Sender<Arc<ListView>>,
}

/// Channels the actor loop drains.
pub(crate) struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    fetches: mpsc::UnboundedReceiver<Fetched>,
    feed: mpsc::UnboundedReceiver<(u64, FeedSignal)>,
}

impl Actor {
    pub(crate) fn new(
        fetcher: Arc<dyn PageFetcher>,
        subscriber: Arc<dyn ChangeSubscriber>,
        scope: ListScope,
        config: SyncConfig,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, Inbox, watch::Receiver<Arc<ListView>>) {
        let (fetch_tx, fetches) = mpsc::unbounded_channel();
        let (feed_tx, feed) = mpsc::unbounded_channel();

        let list = CanonicalList::new(scope.kind);
        let initial = ListView {
            scope: scope.clone(),
            generation: 0,
            phase: Phase::Empty,
            loading: false,
            feed: FeedStatus::Closed,
            list: list.snapshot(),
        };
        let (view_tx, view_rx) = watch::channel(Arc::new(initial));

        let actor = Self {
            scope,
            config,
            list,
            generation: 0,
            pending: EventBatch::new(),
            flush_at: None,
            fetch_seq: 0,
            in_flight: None,
            feed: FeedStatus::Closed,
            subscription: None,
            fetcher,
            subscriber,
            fetch_tx,
            feed_tx,
            view_tx,
        };
        let inbox = Inbox {
            commands,
            fetches,
            feed,
        };
        (actor, inbox, view_rx)
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox) {
        tracing::info!(scope = %self.scope, "Reconciler started");

        loop {
            let flush_at = self.flush_at;
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(fetched) = inbox.fetches.recv() => self.on_fetched(fetched),
                Some((generation, signal)) = inbox.feed.recv() => self.on_feed(generation, signal),
                _ = flush_deadline(flush_at) => {
                    self.flush();
                }
            }
        }

        self.subscription = None;
        tracing::info!(scope = %self.scope, "Reconciler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::LoadNextPage { reply } => self.load_next_page(reply),
            Command::Reset { filter, reply } => {
                let _ = reply.send(self.reset(filter));
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush());
            }
            Command::ApplyLocal { mutation, reply } => {
                let _ = reply.send(self.apply_local(mutation));
            }
            Command::Rollback { pending, reply } => {
                let _ = reply.send(self.rollback(pending));
            }
            Command::Confirm {
                pending,
                records,
                reply,
            } => {
                let _ = reply.send(self.confirm(pending, records));
            }
            Command::Shutdown => {}
        }
    }

    // ========================================================================
    // Paging
    // ========================================================================

    fn load_next_page(&mut self, reply: oneshot::Sender<Result<LoadOutcome>>) {
        if self.in_flight.is_some() {
            let _ = reply.send(Ok(LoadOutcome::AlreadyLoading));
            return;
        }
        if !self.list.has_more() {
            let _ = reply.send(Ok(LoadOutcome::Exhausted));
            return;
        }

        let request = match self.list.begin_page(self.config.page_size) {
            Ok(request) => request,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };

        // Leaving Empty opens the feed so nothing is missed while loading
        if self.feed == FeedStatus::Closed {
            self.open_feed();
        }

        let seq = self.spawn_fetch(request);
        self.in_flight = Some(InFlight {
            seq,
            reply: Some(reply),
            resync: false,
        });
        self.publish();
    }

    /// Fetch the loaded range again after the feed had a gap.
    ///
    /// A load already in flight is superseded; its caller gets the resync's
    /// outcome instead. A list with nothing loaded has nothing to re-read.
    fn resync(&mut self) {
        let reply = match self.in_flight.take() {
            Some(in_flight) => in_flight.reply,
            None if self.list.pages_merged() > 0 => None,
            None => return,
        };
        self.list.cancel_page();

        let request = match self.list.begin_resync(self.config.page_size) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(scope = %self.scope, error = %err, "Cannot resync list");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.into()));
                }
                return;
            }
        };
        tracing::info!(
            scope = %self.scope,
            generation = self.generation,
            page_size = request.page_size,
            "Change feed reconnected, resyncing list"
        );

        let seq = self.spawn_fetch(request);
        self.in_flight = Some(InFlight {
            seq,
            reply,
            resync: true,
        });
    }

    fn spawn_fetch(&mut self, request: PageRequest) -> u64 {
        self.fetch_seq += 1;
        tracing::debug!(
            scope = %self.scope,
            generation = self.generation,
            offset = request.offset,
            page_size = request.page_size,
            "Fetching page"
        );

        let fetcher = Arc::clone(&self.fetcher);
        let scope = self.scope.clone();
        let tx = self.fetch_tx.clone();
        let generation = self.generation;
        let seq = self.fetch_seq;
        tokio::spawn(async move {
            let result = fetcher.fetch_page(&scope, request).await;
            let _ = tx.send(Fetched {
                generation,
                seq,
                result,
            });
        });
        seq
    }

    fn resyncing(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|in_flight| in_flight.resync)
    }

    fn on_fetched(&mut self, fetched: Fetched) {
        if fetched.generation != self.generation {
            tracing::debug!(
                stale = fetched.generation,
                current = self.generation,
                "Discarding stale page"
            );
            return;
        }
        if self.in_flight.as_ref().map(|in_flight| in_flight.seq) != Some(fetched.seq) {
            tracing::debug!(seq = fetched.seq, "Discarding superseded page");
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        let outcome = match fetched.result {
            Ok(page) => {
                // Events queue up while nothing is loaded and while resyncing
                let queued = in_flight.resync || self.list.pages_merged() == 0;
                let merged = if in_flight.resync {
                    self.list.resync(page)
                } else {
                    self.list.merge_page(page)
                };
                match merged {
                    Ok(report) => {
                        tracing::debug!(
                            scope = %self.scope,
                            added = report.added,
                            skipped = report.skipped,
                            has_more = report.has_more,
                            resync = in_flight.resync,
                            "Page merged"
                        );
                        if queued {
                            let applied = self.apply_pending();
                            if applied.changed() {
                                tracing::debug!(
                                    inserted = applied.inserted,
                                    updated = applied.updated,
                                    removed = applied.removed,
                                    "Applied events queued during load"
                                );
                            }
                        }
                        Ok(LoadOutcome::Merged(report))
                    }
                    Err(err) => {
                        self.list.cancel_page();
                        tracing::warn!(scope = %self.scope, error = %err, "Rejected page");
                        Err(SyncError::from(err))
                    }
                }
            }
            Err(err) => {
                self.list.cancel_page();
                tracing::warn!(scope = %self.scope, error = %err, "Page fetch failed");
                Err(SyncError::FetchFailure(err))
            }
        };

        if in_flight.resync {
            if let Err(err) = &outcome {
                // The list may be missing changes; only a refresh can tell
                tracing::error!(scope = %self.scope, error = %err, "Resync failed");
                self.subscription = None;
                self.feed = FeedStatus::Lost {
                    attempts: 0,
                    reason: format!("resync failed: {err}"),
                };
            }
        }

        self.publish();
        if let Some(reply) = in_flight.reply {
            let _ = reply.send(outcome);
        }
    }

    fn reset(&mut self, filter: Option<ListFilter>) -> Result<()> {
        if let Some(filter) = filter {
            filter.validate()?;
            self.scope.filter = filter;
        }

        self.generation += 1;
        self.list.clear();
        self.pending = EventBatch::new();
        self.flush_at = None;
        self.subscription = None;
        self.feed = FeedStatus::Closed;

        if let Some(reply) = self.in_flight.take().and_then(|in_flight| in_flight.reply) {
            let _ = reply.send(Ok(LoadOutcome::Discarded));
        }

        tracing::info!(scope = %self.scope, generation = self.generation, "List reset");
        self.publish();
        Ok(())
    }

    // ========================================================================
    // Change feed
    // ========================================================================

    fn open_feed(&mut self) {
        self.subscription = Some(Subscription::open(
            Arc::clone(&self.subscriber),
            self.scope.clone(),
            self.generation,
            self.config.reconnect.clone(),
            self.feed_tx.clone(),
        ));
        self.feed = FeedStatus::Connecting;
    }

    fn on_feed(&mut self, generation: u64, signal: FeedSignal) {
        if generation != self.generation {
            return;
        }

        match signal {
            FeedSignal::Up => {
                let reconnected = matches!(self.feed, FeedStatus::Reconnecting { .. });
                self.feed = FeedStatus::Live;
                if reconnected {
                    self.resync();
                }
                self.publish();
            }
            FeedSignal::Event(event) => {
                let narrowed = ScopeNarrower {
                    scope: &self.scope,
                    list: &self.list,
                    queued: &self.pending,
                }
                .apply(event);
                let Some(event) = narrowed else {
                    return;
                };
                tracing::trace!(id = %event.id(), "Change event queued");
                self.pending.push(event);
                if !self.applying() {
                    return;
                }
                if self.pending.received() >= self.config.max_batch {
                    self.flush();
                } else {
                    self.flush_at = Some(Instant::now() + self.config.debounce);
                }
            }
            FeedSignal::Down { attempt, reason } => {
                self.feed = FeedStatus::Reconnecting { attempt, reason };
                self.publish();
            }
            FeedSignal::Lost { attempts, reason } => {
                self.subscription = None;
                self.feed = FeedStatus::Lost { attempts, reason };
                self.publish();
            }
        }
    }

    /// Apply queued events without publishing.
    fn apply_pending(&mut self) -> BatchReport {
        self.flush_at = None;
        if self.pending.is_empty() {
            return BatchReport::default();
        }
        let received = self.pending.received();
        let report = self.list.apply_batch(self.pending.drain());
        tracing::debug!(
            scope = %self.scope,
            received,
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            ignored = report.ignored,
            "Applied change batch"
        );
        report
    }

    fn flush(&mut self) -> BatchReport {
        if !self.applying() {
            self.flush_at = None;
            return BatchReport::default();
        }
        let report = self.apply_pending();
        if report.changed() {
            self.publish();
        }
        report
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    fn apply_local(&mut self, mutation: LocalMutation) -> Result<PendingLocal> {
        // Queued remote changes to the same record go first
        if self.pending.get(mutation.target()).is_some() {
            self.flush();
        }

        let snapshot = self.list.apply_local(mutation)?;
        self.publish();
        Ok(PendingLocal {
            generation: self.generation,
            snapshot,
        })
    }

    fn rollback(&mut self, pending: PendingLocal) -> bool {
        if pending.generation != self.generation {
            pending.snapshot.discard();
            return false;
        }
        self.list.restore(pending.snapshot);
        self.publish();
        true
    }

    fn confirm(&mut self, pending: PendingLocal, records: Vec<Record>) -> bool {
        if pending.generation != self.generation {
            pending.snapshot.discard();
            return false;
        }
        let provisional = pending.snapshot.provisional().is_some();
        let report = self.list.confirm(pending.snapshot, records);
        if report.changed() || provisional {
            self.publish();
        }
        true
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Whether change events go to the list now rather than wait in the queue.
    fn applying(&self) -> bool {
        self.phase() == Phase::Ready && !self.resyncing()
    }

    fn phase(&self) -> Phase {
        if self.list.pages_merged() > 0 {
            Phase::Ready
        } else if self.in_flight.is_some() {
            Phase::Loading
        } else {
            Phase::Empty
        }
    }

    fn publish(&self) {
        let view = ListView {
            scope: self.scope.clone(),
            generation: self.generation,
            phase: self.phase(),
            loading: self.in_flight.is_some(),
            feed: self.feed.clone(),
            list: self.list.snapshot(),
        };
        self.view_tx.send_replace(Arc::new(view));
    }
}

async fn flush_deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
