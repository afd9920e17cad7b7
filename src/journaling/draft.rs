use std::time::Instant;

use crossbeam_channel::Receiver;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::DraftConfig;

use super::debounce::Debouncer;
use super::gateway::{EntryFields, EntryId, GatewayError, Visibility};
use super::identity::{IdentityResolver, Resolution};
use super::stats::DerivedStats;
use super::status::{DraftEvent, SaveStatus, StatusPublisher};
use super::version::{SaveStamp, VersionGuard};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("draft has not been saved yet, nothing to delete")]
    NotPersisted,
    #[error("entry {0} is already being deleted")]
    DeletePending(EntryId),
    #[error("draft session has ended")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveRequest {
    Create(EntryFields),
    Update { id: EntryId, fields: EntryFields },
}

/// One dispatched save. The fields are an immutable snapshot taken when the
/// debounce fired; the stamp decides whether its completion still counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTicket {
    pub stamp: SaveStamp,
    pub request: SaveRequest,
}

impl SaveTicket {
    pub fn fields(&self) -> &EntryFields {
        match &self.request {
            SaveRequest::Create(fields) => fields,
            SaveRequest::Update { fields, .. } => fields,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.request, SaveRequest::Create(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAck {
    Created(EntryId),
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteTicket {
    pub id: EntryId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Deleting(EntryId),
    Deleted,
    Closed,
}

/// In-memory state of one journal entry under edit.
///
/// The draft never performs I/O. Callers feed it edits and clock readings,
/// execute the tickets it hands out, and report completions back in whatever
/// order they arrive.
#[derive(Debug)]
pub struct Draft {
    content: String,
    visibility: Visibility,
    stats: DerivedStats,
    identity: IdentityResolver,
    guard: VersionGuard,
    debounce: Debouncer,
    publisher: StatusPublisher,
    lifecycle: Lifecycle,
    deferred: bool,
}

impl Draft {
    pub fn new(config: &DraftConfig) -> Self {
        Self::build(
            config,
            IdentityResolver::unbound(),
            String::new(),
            config.default_visibility,
        )
    }

    pub fn hydrate(
        config: &DraftConfig,
        id: EntryId,
        content: impl Into<String>,
        visibility: Visibility,
    ) -> Self {
        Self::build(
            config,
            IdentityResolver::bound(id),
            content.into(),
            visibility,
        )
    }

    /// Unbound draft that starts out with unsaved content.
    pub fn with_content(
        config: &DraftConfig,
        content: impl Into<String>,
        visibility: Visibility,
        now: Instant,
    ) -> Self {
        let mut draft = Self::build(
            config,
            IdentityResolver::unbound(),
            content.into(),
            visibility,
        );
        draft.touch(now);
        draft
    }

    fn build(
        config: &DraftConfig,
        identity: IdentityResolver,
        content: String,
        visibility: Visibility,
    ) -> Self {
        let stats = DerivedStats::from_content(&content);
        Self {
            content,
            visibility,
            stats,
            identity,
            guard: VersionGuard::new(),
            debounce: Debouncer::new(config.debounce_duration()),
            publisher: StatusPublisher::new(SaveStatus::Idle),
            lifecycle: Lifecycle::Active,
            deferred: false,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn word_count(&self) -> usize {
        self.stats.word_count
    }

    pub fn char_count(&self) -> usize {
        self.stats.char_count
    }

    pub fn identity(&self) -> Option<EntryId> {
        self.identity.identity()
    }

    pub fn version(&self) -> u64 {
        self.guard.current()
    }

    pub fn status(&self) -> &SaveStatus {
        self.publisher.status()
    }

    pub fn last_saved_at(&self) -> Option<OffsetDateTime> {
        self.publisher.last_saved_at()
    }

    pub fn subscribe(&mut self) -> Receiver<DraftEvent> {
        self.publisher.subscribe()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_active() {
            self.debounce.deadline()
        } else {
            None
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle == Lifecycle::Deleted
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn set_content(&mut self, text: impl Into<String>, now: Instant) -> Result<(), DraftError> {
        self.ensure_mutable()?;
        let text = text.into();
        if self.content == text {
            return Ok(());
        }
        self.content = text;
        self.stats = DerivedStats::from_content(&self.content);
        self.touch(now);
        Ok(())
    }

    pub fn set_visibility(&mut self, visibility: Visibility, now: Instant) -> Result<(), DraftError> {
        self.ensure_mutable()?;
        if self.visibility == visibility {
            return Ok(());
        }
        self.visibility = visibility;
        self.touch(now);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), DraftError> {
        match self.lifecycle {
            Lifecycle::Active => Ok(()),
            Lifecycle::Deleting(id) => Err(DraftError::DeletePending(id)),
            Lifecycle::Deleted | Lifecycle::Closed => Err(DraftError::Closed),
        }
    }

    fn touch(&mut self, now: Instant) {
        self.guard.bump();
        self.publisher.mark_dirty();
        self.debounce.notify(now);
    }

    /// Hands out a save once the quiet interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<SaveTicket> {
        if !self.is_active() || !self.debounce.poll(now) {
            return None;
        }
        self.dispatch()
    }

    /// Dispatches immediately, skipping the quiet interval. Only a draft with
    /// unsaved or failed changes has anything to send.
    pub fn save_now(&mut self) -> Option<SaveTicket> {
        if !self.is_active() {
            return None;
        }
        if !matches!(
            self.publisher.status(),
            SaveStatus::Dirty | SaveStatus::Errored { .. }
        ) {
            return None;
        }
        self.debounce.cancel();
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SaveTicket> {
        let target = match self.identity.resolve() {
            Resolution::Defer => {
                tracing::debug!(version = self.version(), "creation in flight, deferring save");
                self.deferred = true;
                return None;
            }
            Resolution::Create => None,
            Resolution::Update(id) => Some(id),
        };
        let stamp = self.guard.stamp();
        let fields = EntryFields {
            content: self.content.clone(),
            visibility: self.visibility,
            stats: self.stats,
        };
        let request = match target {
            Some(id) => SaveRequest::Update { id, fields },
            None => {
                self.identity.begin_create(stamp);
                SaveRequest::Create(fields)
            }
        };
        self.publisher.mark_saving();
        tracing::debug!(
            version = stamp.version,
            sequence = stamp.sequence,
            create = matches!(request, SaveRequest::Create(_)),
            "dispatching save"
        );
        Some(SaveTicket { stamp, request })
    }

    pub fn complete_save(
        &mut self,
        stamp: SaveStamp,
        outcome: Result<SaveAck, GatewayError>,
        now: Instant,
    ) {
        if matches!(self.lifecycle, Lifecycle::Closed | Lifecycle::Deleted) {
            tracing::debug!(sequence = stamp.sequence, "ignoring save completion after teardown");
            return;
        }

        match &outcome {
            Ok(SaveAck::Created(id)) => {
                if self.identity.finish_create(stamp, *id) {
                    tracing::info!(entry = %id, "draft bound to new entry");
                    self.publisher.publish(DraftEvent::IdentityBound(*id));
                } else {
                    tracing::warn!(entry = %id, "creation ack does not match the creation in flight");
                }
            }
            Ok(SaveAck::Updated) => {}
            Err(_) => self.identity.abandon_create(stamp),
        }

        if self.is_active() {
            if self.guard.is_authoritative(stamp) {
                match outcome {
                    Ok(_) => self.publisher.mark_saved(OffsetDateTime::now_utc()),
                    Err(error) => {
                        tracing::warn!(%error, version = stamp.version, "save failed");
                        self.publisher.mark_errored(error);
                    }
                }
            } else {
                tracing::debug!(
                    version = stamp.version,
                    current = self.version(),
                    superseded = self.guard.is_superseded(stamp),
                    "discarding stale save completion"
                );
            }

            if self.deferred && !self.identity.creation_in_flight() {
                self.deferred = false;
                if *self.publisher.status() == SaveStatus::Dirty {
                    self.debounce.notify(now);
                }
            }
        }
    }

    pub fn request_delete(&mut self) -> Result<DeleteTicket, DraftError> {
        self.ensure_mutable()?;
        let id = self.identity.identity().ok_or(DraftError::NotPersisted)?;
        self.debounce.cancel();
        self.deferred = false;
        self.lifecycle = Lifecycle::Deleting(id);
        tracing::debug!(entry = %id, "dispatching delete");
        Ok(DeleteTicket { id })
    }

    pub fn complete_delete(&mut self, ticket: DeleteTicket, outcome: Result<(), GatewayError>) {
        if self.lifecycle != Lifecycle::Deleting(ticket.id) {
            return;
        }
        match outcome {
            Ok(()) => {
                tracing::info!(entry = %ticket.id, "entry deleted");
                self.lifecycle = Lifecycle::Deleted;
                self.publisher.publish(DraftEvent::Deleted(ticket.id));
            }
            Err(error) => {
                tracing::warn!(entry = %ticket.id, %error, "delete failed");
                self.lifecycle = Lifecycle::Active;
                self.publisher.publish(DraftEvent::DeleteFailed {
                    id: ticket.id,
                    error: error.clone(),
                });
                self.publisher.mark_errored(error);
            }
        }
    }

    /// Ends the editing session. Pending debounce is dropped, not flushed, and
    /// every later completion is ignored.
    pub fn close(&mut self) {
        self.debounce.cancel();
        self.deferred = false;
        if self.lifecycle != Lifecycle::Deleted {
            self.lifecycle = Lifecycle::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    const QUIET: Duration = Duration::from_millis(1500);

    fn config() -> DraftConfig {
        DraftConfig {
            debounce_ms: 1500,
            ..DraftConfig::default()
        }
    }

    fn ms(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn hello_world_creates_once_and_saves() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        assert_eq!(*draft.status(), SaveStatus::Idle);

        draft.set_content("Hello world", start).unwrap();
        assert_eq!(*draft.status(), SaveStatus::Dirty);
        assert!(draft.poll(ms(start, 1499)).is_none());

        let ticket = draft.poll(start + QUIET).expect("save dispatched");
        assert!(draft.poll(start + QUIET * 3).is_none());
        assert_eq!(*draft.status(), SaveStatus::Saving);
        assert_matches!(&ticket.request, SaveRequest::Create(fields) => {
            assert_eq!(fields.content, "Hello world");
            assert_eq!(fields.stats.word_count, 2);
            assert_eq!(fields.stats.char_count, 11);
        });

        let id = EntryId::new();
        draft.complete_save(ticket.stamp, Ok(SaveAck::Created(id)), start + QUIET);
        assert_eq!(draft.identity(), Some(id));
        assert_matches!(draft.status(), SaveStatus::Saved { .. });
        assert!(draft.last_saved_at().is_some());
    }

    #[test]
    fn burst_of_edits_dispatches_last_content_once() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        draft.set_content("A", start).unwrap();
        assert!(draft.poll(ms(start, 1000)).is_none());
        draft.set_content("A B", ms(start, 1000)).unwrap();

        assert!(draft.poll(ms(start, 2000)).is_none());
        let ticket = draft.poll(ms(start, 2500)).expect("one save");
        assert_eq!(ticket.fields().content, "A B");
        assert!(draft.poll(ms(start, 9000)).is_none());
    }

    #[test]
    fn second_trigger_during_creation_is_deferred_then_updates() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        let events = draft.subscribe();

        draft.set_content("first", start).unwrap();
        let create = draft.poll(start + QUIET).expect("create");
        assert!(create.is_create());

        draft.set_content("first draft", ms(start, 1600)).unwrap();
        assert!(draft.poll(ms(start, 3100)).is_none(), "must not create twice");
        assert_eq!(*draft.status(), SaveStatus::Dirty);

        let id = EntryId::new();
        draft.complete_save(create.stamp, Ok(SaveAck::Created(id)), ms(start, 3200));
        assert_eq!(draft.identity(), Some(id));
        assert_eq!(*draft.status(), SaveStatus::Dirty, "stale create keeps status");
        assert!(events
            .try_iter()
            .any(|event| event == DraftEvent::IdentityBound(id)));

        let update = draft.poll(ms(start, 4700)).expect("deferred edits flushed");
        assert_eq!(
            update.request,
            SaveRequest::Update {
                id,
                fields: EntryFields {
                    content: "first draft".into(),
                    visibility: Visibility::Shared,
                    stats: DerivedStats::from_content("first draft"),
                },
            }
        );
    }

    #[test]
    fn superseded_update_completion_is_discarded() {
        let start = Instant::now();
        let id = EntryId::new();
        let mut draft = Draft::hydrate(&config(), id, "E1 body", Visibility::Private);
        assert_eq!(*draft.status(), SaveStatus::Idle);

        draft.set_content("E1 body, edited", start).unwrap();
        let first = draft.poll(start + QUIET).expect("first update");
        assert_matches!(first.request, SaveRequest::Update { id: target, .. } if target == id);

        draft.set_content("E1 body, edited again", ms(start, 1600)).unwrap();
        assert_eq!(*draft.status(), SaveStatus::Dirty);

        draft.complete_save(first.stamp, Ok(SaveAck::Updated), ms(start, 1700));
        assert_eq!(*draft.status(), SaveStatus::Dirty);
        assert!(draft.last_saved_at().is_none());

        let second = draft.poll(ms(start, 3100)).expect("second update");
        assert_eq!(*draft.status(), SaveStatus::Saving);
        draft.complete_save(second.stamp, Ok(SaveAck::Updated), ms(start, 3200));
        assert_matches!(draft.status(), SaveStatus::Saved { .. });
    }

    #[test]
    fn late_failure_does_not_error_a_newer_state() {
        let start = Instant::now();
        let mut draft = Draft::hydrate(&config(), EntryId::new(), "", Visibility::Shared);
        draft.set_content("one", start).unwrap();
        let first = draft.poll(start + QUIET).unwrap();
        draft.set_content("one two", ms(start, 1600)).unwrap();
        let second = draft.poll(ms(start, 3100)).unwrap();

        draft.complete_save(second.stamp, Ok(SaveAck::Updated), ms(start, 3200));
        let saved = draft.status().clone();
        let saved_at = draft.last_saved_at();
        draft.complete_save(
            first.stamp,
            Err(GatewayError::Backend("timeout".into())),
            ms(start, 3300),
        );
        assert_eq!(*draft.status(), saved);
        assert_eq!(draft.last_saved_at(), saved_at);
    }

    #[test]
    fn authoritative_failure_errors_and_next_edit_recovers() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        draft.set_content("x", start).unwrap();
        let ticket = draft.poll(start + QUIET).unwrap();
        draft.complete_save(ticket.stamp, Err(GatewayError::Unauthenticated), start + QUIET);

        assert_eq!(
            *draft.status(),
            SaveStatus::Errored {
                error: GatewayError::Unauthenticated
            }
        );
        assert_eq!(draft.identity(), None);

        draft.set_content("xy", ms(start, 2000)).unwrap();
        assert_eq!(*draft.status(), SaveStatus::Dirty);
        let retry = draft.poll(ms(start, 3500)).unwrap();
        assert!(retry.is_create(), "failed creation may be retried");
    }

    #[test]
    fn save_now_retries_errored_draft_without_edit() {
        let start = Instant::now();
        let mut draft = Draft::hydrate(&config(), EntryId::new(), "", Visibility::Shared);
        assert!(draft.save_now().is_none(), "nothing to save while idle");

        draft.set_content("body", start).unwrap();
        let first = draft.poll(start + QUIET).unwrap();
        draft.complete_save(first.stamp, Err(GatewayError::Backend("down".into())), start + QUIET);

        let retry = draft.save_now().expect("retry dispatched");
        assert_eq!(retry.stamp.version, first.stamp.version);
        draft.complete_save(first.stamp, Ok(SaveAck::Updated), start + QUIET);
        assert_eq!(*draft.status(), SaveStatus::Saving, "older dispatch is not authoritative");
        draft.complete_save(retry.stamp, Ok(SaveAck::Updated), start + QUIET);
        assert_matches!(draft.status(), SaveStatus::Saved { .. });
    }

    #[test]
    fn visibility_toggle_marks_dirty_and_noop_edits_do_not() {
        let start = Instant::now();
        let mut draft = Draft::hydrate(&config(), EntryId::new(), "same", Visibility::Shared);

        draft.set_content("same", start).unwrap();
        draft.set_visibility(Visibility::Shared, start).unwrap();
        assert_eq!(draft.version(), 0);
        assert_eq!(*draft.status(), SaveStatus::Idle);

        draft.set_visibility(Visibility::Private, start).unwrap();
        assert_eq!(draft.version(), 1);
        let ticket = draft.poll(start + QUIET).unwrap();
        assert_eq!(ticket.fields().visibility, Visibility::Private);
    }

    #[test]
    fn seeded_draft_starts_dirty() {
        let start = Instant::now();
        let draft = Draft::with_content(&config(), "seed", Visibility::Private, start);
        assert_eq!(*draft.status(), SaveStatus::Dirty);
        assert_eq!(draft.word_count(), 1);
        assert_eq!(draft.next_deadline(), Some(start + QUIET));
    }

    #[test]
    fn delete_cancels_pending_save() {
        let start = Instant::now();
        let id = EntryId::new();
        let mut draft = Draft::hydrate(&config(), id, "keep", Visibility::Shared);
        let events = draft.subscribe();

        draft.set_content("keep typing", start).unwrap();
        let ticket = draft.request_delete().expect("bound draft can delete");
        assert_eq!(ticket.id, id);
        assert!(draft.poll(start + QUIET * 2).is_none());
        assert_eq!(
            draft.set_content("more", start + QUIET),
            Err(DraftError::DeletePending(id))
        );
        assert_eq!(draft.request_delete(), Err(DraftError::DeletePending(id)));

        draft.complete_delete(ticket, Ok(()));
        assert!(draft.is_deleted());
        assert!(events.try_iter().any(|event| event == DraftEvent::Deleted(id)));
        assert!(draft.save_now().is_none());
    }

    #[test]
    fn delete_requires_identity_and_failure_keeps_draft() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        assert_eq!(draft.request_delete(), Err(DraftError::NotPersisted));

        let id = EntryId::new();
        let mut draft = Draft::hydrate(&config(), id, "text", Visibility::Shared);
        let ticket = draft.request_delete().unwrap();
        draft.complete_delete(ticket, Err(GatewayError::NotFound(id)));

        assert!(!draft.is_deleted());
        assert_eq!(draft.identity(), Some(id));
        assert_matches!(draft.status(), SaveStatus::Errored { .. });
        draft.set_content("text again", start).unwrap();
        assert_eq!(*draft.status(), SaveStatus::Dirty);
    }

    #[test]
    fn completions_after_close_are_ignored() {
        let start = Instant::now();
        let mut draft = Draft::new(&config());
        draft.set_content("bye", start).unwrap();
        let ticket = draft.poll(start + QUIET).unwrap();
        draft.set_content("bye now", ms(start, 1600)).unwrap();

        draft.close();
        assert!(draft.next_deadline().is_none());
        draft.complete_save(ticket.stamp, Ok(SaveAck::Created(EntryId::new())), ms(start, 1700));

        assert_eq!(draft.identity(), None);
        assert_eq!(*draft.status(), SaveStatus::Dirty);
        assert_eq!(draft.set_content("late", ms(start, 1800)), Err(DraftError::Closed));
    }
}
