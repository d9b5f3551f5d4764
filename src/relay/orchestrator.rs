//! The relay: turns source events into sends, edits and deletes.
//!
//! Each entry point handles one event and returns an [`EventReport`] with
//! one outcome per destination. Destination failures are isolated in the
//! report; only store failures abort the event (so it can be redelivered).
//!
//! Sends happen before records are written, and no lock is held across a
//! network call. A retried send that finds its record already written is a
//! no-op.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::channels::{MessagingClient, Outgoing};
use crate::config::RelayConfig;
use crate::error::{ChannelError, DatabaseError, RelayError, TrackerError};
use crate::relay::events::{DeliveryStatus, EventKind, EventReport, RelayEvent, SkipReason};
use crate::relay::notify::Notifier;
use crate::relay::patches::PatchQueue;
use crate::relay::retry::{self, RetryPolicy};
use crate::rules::model::{DeliveryMode, Destination, Rule, SourceProfile};
use crate::rules::{Route, RuleStore, find_route};
use crate::tracker::{CopyRef, DeliveryRecord, DeliveryTracker};
use crate::transform::{self, RenderContext};
use crate::types::{Album, ChatId, MessageId, SourceKey, SourceMessage};

/// Result of one destination branch of an event.
type Branch = (ChatId, Result<DeliveryStatus, RelayError>);

/// Content ready to send to one destination.
struct Prepared {
    outgoing: Outgoing,
    /// Render inputs, kept when the text needs a self-link patch.
    patch: Option<RenderContext>,
}

/// Copies to delete for one delivery record.
struct DeleteTarget {
    record: DeliveryRecord,
    copies: Vec<CopyRef>,
}

/// Event orchestrator shared by all source lanes.
pub struct Relay {
    rules: Arc<dyn RuleStore>,
    tracker: Arc<DeliveryTracker>,
    client: Arc<dyn MessagingClient>,
    /// Bounds concurrent client calls across all lanes.
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    send_timeout: Duration,
    patches: PatchQueue,
    notifier: Option<Notifier>,
}

impl Relay {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        tracker: Arc<DeliveryTracker>,
        client: Arc<dyn MessagingClient>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            rules,
            tracker,
            client,
            workers: Arc::new(Semaphore::new(config.max_parallel_sends.max(1))),
            retry: config.retry,
            send_timeout: config.send_timeout,
            patches: PatchQueue::new(),
            notifier: None,
        }
    }

    /// Send operator notifications for failed deliveries.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn patches(&self) -> &PatchQueue {
        &self.patches
    }

    /// Finish outstanding patches and refuse further client calls.
    pub async fn shutdown(&self) {
        self.patches.flush().await;
        self.workers.close();
        info!("Relay shut down");
    }

    /// Dispatch any event to its handler.
    pub async fn handle(&self, event: &RelayEvent) -> Result<EventReport, RelayError> {
        match event {
            RelayEvent::New(msg) => self.new_message(msg).await,
            RelayEvent::AlbumComplete(album) => self.album_complete(album).await,
            RelayEvent::Edit(msg) => self.edit_message(msg).await,
            RelayEvent::Delete(key) => self.delete_message(key).await,
        }
    }

    // ── New messages ────────────────────────────────────────────────

    /// Deliver a new source message to every matching destination.
    ///
    /// Album members bound for copy-once destinations are deferred to
    /// [`Relay::album_complete`].
    pub async fn new_message(&self, msg: &SourceMessage) -> Result<EventReport, RelayError> {
        let routes = self.rules.destinations_for(msg.chat, &msg.text).await?;
        let mut report = EventReport::new(EventKind::New, msg.key());

        let mut sends = Vec::with_capacity(routes.len());
        for route in routes {
            if msg.media_group.is_some() && route.destination.copy_once {
                debug!(
                    source = %msg.key(),
                    destination = route.destination.chat,
                    "Album member deferred to album completion"
                );
                report.push(route.destination.chat, DeliveryStatus::Deferred);
            } else {
                sends.push(route);
            }
        }

        let branches = join_all(sends.iter().map(|route| async move {
            (route.destination.chat, self.deliver_message(msg, route).await)
        }))
        .await;

        let report = collect(report, branches)?;
        Ok(self.finish(report))
    }

    async fn deliver_message(
        &self,
        msg: &SourceMessage,
        route: &Route,
    ) -> Result<DeliveryStatus, RelayError> {
        let dest = &route.destination;
        let key = msg.key();
        if self.tracker.get(&key, dest.chat).await?.is_some() {
            return Ok(DeliveryStatus::AlreadyDelivered);
        }

        let prepared = self.prepare(msg, route).await?;
        let client = &self.client;
        let outgoing = &prepared.outgoing;
        let chat = dest.chat;
        let copy = match self
            .call("send", move || client.send(chat, outgoing))
            .await?
        {
            Ok(copy) => copy,
            Err(e) => return Ok(DeliveryStatus::Failed(e)),
        };

        self.record(&key, dest, vec![CopyRef { source: msg.id, copy }])
            .await?;
        debug!(source = %key, destination = chat, copy, "Message delivered");

        if let Some(ctx) = prepared.patch {
            self.schedule_patch(dest, &route.rule.profile, msg, ctx, copy)
                .await;
        }
        Ok(DeliveryStatus::Sent(vec![copy]))
    }

    // ── Albums ──────────────────────────────────────────────────────

    /// Deliver a completed album.
    ///
    /// Copy-once destinations receive the whole album as one batch, sent by
    /// whichever caller wins the album claim. Other destinations receive any
    /// member not yet delivered, one by one.
    pub async fn album_complete(&self, album: &Album) -> Result<EventReport, RelayError> {
        let key = album.key();
        if album.members.is_empty() {
            return Err(RelayError::InvalidEvent(format!("album {key} has no members")));
        }

        let routes = self
            .rules
            .destinations_for(album.chat, album.match_text())
            .await?;
        let report = EventReport::new(EventKind::AlbumComplete, key);

        let branches = join_all(routes.iter().map(|route| async move {
            let status = if route.destination.copy_once {
                self.deliver_album(album, route).await
            } else {
                self.deliver_members(album, route).await
            };
            (route.destination.chat, status)
        }))
        .await;

        let report = collect(report, branches)?;
        Ok(self.finish(report))
    }

    async fn deliver_album(&self, album: &Album, route: &Route) -> Result<DeliveryStatus, RelayError> {
        let dest = &route.destination;
        let key = album.key();
        if self.tracker.get(&key, dest.chat).await?.is_some() {
            return Ok(DeliveryStatus::AlreadyDelivered);
        }

        let mut prepared = Vec::with_capacity(album.members.len());
        for member in &album.members {
            prepared.push(self.prepare(member, route).await?);
        }

        if !self.tracker.mark_album_sent(&key, dest.chat).await? {
            debug!(album = %key, destination = dest.chat, "Album claimed by another worker");
            return Ok(DeliveryStatus::ClaimLost);
        }

        let items: Vec<Outgoing> = prepared.iter().map(|p| p.outgoing.clone()).collect();
        let client = &self.client;
        let items_ref = &items;
        let chat = dest.chat;
        let ids = match self
            .call("send_album", move || client.send_album(chat, items_ref))
            .await
        {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                self.tracker.release_album_claim(&key, chat).await?;
                return Ok(DeliveryStatus::Failed(e));
            }
            Err(e) => {
                self.tracker.release_album_claim(&key, chat).await?;
                return Err(e);
            }
        };

        if ids.len() != album.members.len() {
            warn!(
                album = %key,
                destination = chat,
                members = album.members.len(),
                copies = ids.len(),
                "Album copy count differs from member count"
            );
        }
        let copies: Vec<CopyRef> = album
            .members
            .iter()
            .zip(&ids)
            .map(|(member, copy)| CopyRef {
                source: member.id,
                copy: *copy,
            })
            .collect();
        if let Err(e) = self.record(&key, dest, copies).await {
            // Without a record the claim would block every redelivery.
            if let Err(release) = self.tracker.release_album_claim(&key, chat).await {
                warn!(
                    album = %key,
                    destination = chat,
                    error = %release,
                    "Failed to release album claim"
                );
            }
            return Err(e);
        }
        info!(album = %key, destination = chat, copies = ids.len(), "Album delivered");

        for ((member, p), copy) in album.members.iter().zip(prepared).zip(&ids) {
            if let Some(ctx) = p.patch {
                self.schedule_patch(dest, &route.rule.profile, member, ctx, *copy)
                    .await;
            }
        }
        Ok(DeliveryStatus::Sent(ids))
    }

    async fn deliver_members(
        &self,
        album: &Album,
        route: &Route,
    ) -> Result<DeliveryStatus, RelayError> {
        let mut sent = Vec::new();
        let mut failure = None;

        for member in &album.members {
            match self.deliver_message(member, route).await? {
                DeliveryStatus::Sent(copies) => sent.extend(copies),
                DeliveryStatus::Failed(e) => {
                    failure.get_or_insert(e);
                }
                _ => {}
            }
        }

        Ok(match failure {
            Some(e) => DeliveryStatus::Failed(e),
            None if sent.is_empty() => DeliveryStatus::AlreadyDelivered,
            None => DeliveryStatus::Sent(sent),
        })
    }

    // ── Edits ───────────────────────────────────────────────────────

    /// Propagate a source edit to every existing copy.
    ///
    /// Messages that were never delivered are ignored; an edit never
    /// creates a new copy.
    pub async fn edit_message(&self, msg: &SourceMessage) -> Result<EventReport, RelayError> {
        let report = EventReport::new(EventKind::Edit, msg.key());
        let targets = self.copies_of(msg.chat, msg.id).await?;
        if targets.is_empty() {
            debug!(source = %msg.key(), "Edit of undelivered message dropped");
            return Ok(report);
        }

        let rules = self.rules.rules_for(msg.chat).await?;
        let rules = &rules;
        let branches = join_all(targets.iter().map(|(record, copy)| async move {
            (
                record.destination,
                self.edit_copy(msg, record, *copy, rules).await,
            )
        }))
        .await;

        let report = collect(report, branches)?;
        Ok(self.finish(report))
    }

    async fn edit_copy(
        &self,
        msg: &SourceMessage,
        record: &DeliveryRecord,
        copy: MessageId,
        rules: &[Arc<Rule>],
    ) -> Result<DeliveryStatus, RelayError> {
        if record.flags.mode == DeliveryMode::Forward {
            return Ok(DeliveryStatus::Skipped(SkipReason::Forwarded));
        }
        let Some(route) = find_route(rules, record.destination) else {
            debug!(
                source = %msg.key(),
                destination = record.destination,
                "Destination no longer configured, edit skipped"
            );
            return Ok(DeliveryStatus::Skipped(SkipReason::Unconfigured));
        };

        let dest = &route.destination;
        let profile = &route.rule.profile;
        let ctx = self
            .render_context(msg, profile, dest.chat)
            .await?
            .with_self_copy(copy);
        let rendered = transform::render(dest, profile, &msg.text, &ctx);
        let outgoing = Outgoing::Copy {
            text: rendered.text,
            media: msg.media.clone(),
        };

        // The edit carries the final self-links, so a pending patch is moot.
        self.patches.cancel(dest.chat, copy).await;

        let client = &self.client;
        let outgoing = &outgoing;
        let chat = dest.chat;
        Ok(
            match self
                .call("edit", move || client.edit(chat, copy, outgoing))
                .await?
            {
                Ok(()) => DeliveryStatus::Edited,
                Err(e) => DeliveryStatus::Failed(e),
            },
        )
    }

    // ── Deletes ─────────────────────────────────────────────────────

    /// Propagate a source deletion.
    ///
    /// Indelible destinations keep their copy and record. For the others a
    /// record is removed only after its copy is gone on the network.
    pub async fn delete_message(&self, key: &SourceKey) -> Result<EventReport, RelayError> {
        let report = EventReport::new(EventKind::Delete, key.clone());

        let mut targets: Vec<DeleteTarget> = self
            .tracker
            .lookup(key)
            .await?
            .into_iter()
            .map(|record| DeleteTarget {
                copies: record.copies.clone(),
                record,
            })
            .collect();

        if let SourceKey::Message { chat, id } = key {
            if let Some(album) = self.tracker.album_for_member(*chat, *id).await? {
                for record in self.tracker.lookup(&album).await? {
                    if let Some(copy) = record.copy_for(*id) {
                        targets.push(DeleteTarget {
                            copies: vec![CopyRef { source: *id, copy }],
                            record,
                        });
                    }
                }
            }
        }

        let branches = join_all(targets.iter().map(|target| async move {
            (target.record.destination, self.delete_copies(target).await)
        }))
        .await;

        let report = collect(report, branches)?;
        Ok(self.finish(report))
    }

    async fn delete_copies(&self, target: &DeleteTarget) -> Result<DeliveryStatus, RelayError> {
        let record = &target.record;
        let chat = record.destination;
        if record.flags.indelible {
            debug!(source = %record.source, destination = chat, "Indelible copy kept");
            return Ok(DeliveryStatus::Kept);
        }

        let mut failure = None;
        for c in &target.copies {
            self.patches.cancel(chat, c.copy).await;

            let client = &self.client;
            let copy = c.copy;
            match self.call("delete", move || client.delete(chat, copy)).await? {
                Ok(()) => {}
                Err(ChannelError::NotFound { .. }) => {
                    debug!(destination = chat, copy, "Copy already gone");
                }
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            }

            if record.source.is_album() {
                self.tracker
                    .remove_copy(&record.source, chat, c.source)
                    .await?;
            } else {
                self.tracker.remove(&record.source, chat).await?;
            }
        }

        Ok(match failure {
            Some(e) => DeliveryStatus::Failed(e),
            None => DeliveryStatus::Deleted,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Run a client call under a worker permit with retries.
    ///
    /// The outer error means the relay was shut down.
    async fn call<T, F, Fut>(
        &self,
        what: &str,
        op: F,
    ) -> Result<Result<T, ChannelError>, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| RelayError::Closed)?;
        Ok(retry::run(&self.retry, self.send_timeout, what, op).await)
    }

    /// Build the outgoing content for one destination.
    async fn prepare(&self, msg: &SourceMessage, route: &Route) -> Result<Prepared, DatabaseError> {
        let dest = &route.destination;
        if dest.mode == DeliveryMode::Forward {
            return Ok(Prepared {
                outgoing: Outgoing::forward(msg.chat, msg.id),
                patch: None,
            });
        }

        let profile = &route.rule.profile;
        let ctx = self.render_context(msg, profile, dest.chat).await?;
        let rendered = transform::render(dest, profile, &msg.text, &ctx);
        Ok(Prepared {
            outgoing: Outgoing::Copy {
                text: rendered.text,
                media: msg.media.clone(),
            },
            patch: rendered.pending_self_links.then_some(ctx),
        })
    }

    /// Resolve links to other source posts into their copies in `destination`.
    async fn render_context(
        &self,
        msg: &SourceMessage,
        profile: &SourceProfile,
        destination: ChatId,
    ) -> Result<RenderContext, DatabaseError> {
        let mut ctx = RenderContext::new(msg.id);
        for target in transform::referenced_posts(profile, &msg.text) {
            if target == msg.id {
                continue;
            }
            if let Some(copy) = self.copy_in(msg.chat, target, destination).await? {
                ctx.resolved.insert(target, copy);
            }
        }
        Ok(ctx)
    }

    /// Copy of one source message in one destination, direct or via its album.
    async fn copy_in(
        &self,
        chat: ChatId,
        id: MessageId,
        destination: ChatId,
    ) -> Result<Option<MessageId>, DatabaseError> {
        if let Some(record) = self
            .tracker
            .get(&SourceKey::message(chat, id), destination)
            .await?
        {
            return Ok(record.primary_copy());
        }
        let Some(album) = self.tracker.album_for_member(chat, id).await? else {
            return Ok(None);
        };
        Ok(self
            .tracker
            .get(&album, destination)
            .await?
            .and_then(|record| record.copy_for(id)))
    }

    /// Every record holding a copy of a source message, with that copy's id.
    async fn copies_of(
        &self,
        chat: ChatId,
        id: MessageId,
    ) -> Result<Vec<(DeliveryRecord, MessageId)>, DatabaseError> {
        let mut targets: Vec<(DeliveryRecord, MessageId)> = self
            .tracker
            .lookup(&SourceKey::message(chat, id))
            .await?
            .into_iter()
            .filter_map(|record| record.primary_copy().map(|copy| (record, copy)))
            .collect();

        if let Some(album) = self.tracker.album_for_member(chat, id).await? {
            for record in self.tracker.lookup(&album).await? {
                if let Some(copy) = record.copy_for(id) {
                    targets.push((record, copy));
                }
            }
        }
        Ok(targets)
    }

    async fn record(
        &self,
        key: &SourceKey,
        dest: &Destination,
        copies: Vec<CopyRef>,
    ) -> Result<(), RelayError> {
        match self.tracker.record(key, dest.chat, copies, dest.flags()).await {
            Ok(_) | Err(TrackerError::AlreadyRecorded { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Edit a fresh copy so its self-links point at itself.
    async fn schedule_patch(
        &self,
        dest: &Destination,
        profile: &SourceProfile,
        msg: &SourceMessage,
        ctx: RenderContext,
        copy: MessageId,
    ) {
        let rendered = transform::render(dest, profile, &msg.text, &ctx.with_self_copy(copy));
        let outgoing = Outgoing::Copy {
            text: rendered.text,
            media: msg.media.clone(),
        };
        let patch = Patch {
            client: Arc::clone(&self.client),
            workers: Arc::clone(&self.workers),
            retry: self.retry,
            timeout: self.send_timeout,
            chat: dest.chat,
            copy,
            outgoing,
        };
        self.patches.spawn(dest.chat, copy, patch.run()).await;
    }

    /// Log the report and notify the operator of failures.
    fn finish(&self, report: EventReport) -> EventReport {
        for failure in report.failures() {
            let DeliveryStatus::Failed(ref e) = failure.status else {
                continue;
            };
            warn!(
                event_id = %report.event_id,
                kind = %report.kind,
                source = %report.source,
                destination = failure.destination,
                transient = e.is_transient(),
                error = %e,
                "Delivery failed"
            );
            if let Some(ref notifier) = self.notifier {
                notifier.delivery_failed(&report.source, failure.destination, &e.to_string());
            }
        }

        info!(
            event_id = %report.event_id,
            kind = %report.kind,
            source = %report.source,
            destinations = report.outcomes.len(),
            failed = report.failures().count(),
            "Event handled"
        );
        report
    }
}

/// An owned self-link edit, run in the background.
struct Patch {
    client: Arc<dyn MessagingClient>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
    chat: ChatId,
    copy: MessageId,
    outgoing: Outgoing,
}

impl Patch {
    async fn run(self) {
        let Ok(_permit) = self.workers.acquire().await else {
            return;
        };
        let client = &self.client;
        let outgoing = &self.outgoing;
        let (chat, copy) = (self.chat, self.copy);
        match retry::run(&self.retry, self.timeout, "patch", move || {
            client.edit(chat, copy, outgoing)
        })
        .await
        {
            Ok(()) => debug!(destination = chat, copy, "Self-links patched"),
            Err(e) => warn!(destination = chat, copy, error = %e, "Self-link patch failed"),
        }
    }
}

/// Fold branch results into the report; the first store error aborts the event.
fn collect(mut report: EventReport, branches: Vec<Branch>) -> Result<EventReport, RelayError> {
    let mut abort = None;
    for (destination, result) in branches {
        match result {
            Ok(status) => report.push(destination, status),
            Err(e) => {
                warn!(
                    event_id = %report.event_id,
                    source = %report.source,
                    destination,
                    error = %e,
                    "Event aborted"
                );
                abort.get_or_insert(e);
            }
        }
    }
    match abort {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

