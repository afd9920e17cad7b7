use crossbeam_channel::{unbounded, Receiver, Sender};
use time::OffsetDateTime;

use super::gateway::{EntryId, GatewayError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Dirty,
    Saving,
    Saved { at: OffsetDateTime },
    Errored { error: GatewayError },
}

impl SaveStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Dirty => "dirty",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved { .. } => "saved",
            SaveStatus::Errored { .. } => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftEvent {
    StatusChanged(SaveStatus),
    IdentityBound(EntryId),
    Deleted(EntryId),
    DeleteFailed { id: EntryId, error: GatewayError },
}

/// Projects the draft's save state and fans every change out to subscribers.
#[derive(Debug)]
pub struct StatusPublisher {
    status: SaveStatus,
    last_saved_at: Option<OffsetDateTime>,
    subscribers: Vec<Sender<DraftEvent>>,
}

impl StatusPublisher {
    pub fn new(initial: SaveStatus) -> Self {
        Self {
            status: initial,
            last_saved_at: None,
            subscribers: Vec::new(),
        }
    }

    pub fn status(&self) -> &SaveStatus {
        &self.status
    }

    pub fn last_saved_at(&self) -> Option<OffsetDateTime> {
        self.last_saved_at
    }

    pub fn subscribe(&mut self) -> Receiver<DraftEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn mark_dirty(&mut self) {
        self.transition(SaveStatus::Dirty);
    }

    pub fn mark_saving(&mut self) {
        self.transition(SaveStatus::Saving);
    }

    pub fn mark_saved(&mut self, at: OffsetDateTime) {
        self.last_saved_at = Some(at);
        self.transition(SaveStatus::Saved { at });
    }

    pub fn mark_errored(&mut self, error: GatewayError) {
        self.transition(SaveStatus::Errored { error });
    }

    pub fn publish(&mut self, event: DraftEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn transition(&mut self, next: SaveStatus) {
        if self.status == next {
            return;
        }
        tracing::trace!(from = self.status.label(), to = next.label(), "save status");
        self.status = next.clone();
        self.publish(DraftEvent::StatusChanged(next));
    }
}
