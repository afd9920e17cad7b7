use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;

use super::EntryRecord;
use crate::journaling::{
    DerivedStats, EntryFields, EntryGateway, EntryId, GatewayError, OwnerRef, Visibility,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Create { content: String },
    Update { id: EntryId, content: String },
    Delete(EntryId),
}

/// In-memory entry store. Records every call it receives, can inject
/// failures, and can simulate network latency.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    entries: Mutex<HashMap<EntryId, EntryRecord>>,
    calls: Mutex<Vec<GatewayCall>>,
    failures: Mutex<VecDeque<GatewayError>>,
    stalls: Mutex<VecDeque<Duration>>,
    latency: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next call fails with `error` instead of touching the store.
    pub fn fail_next(&self, error: GatewayError) {
        self.failures.lock().push_back(error);
    }

    /// The next call takes `extra` longer than the configured latency.
    pub fn stall_next(&self, extra: Duration) {
        self.stalls.lock().push_back(extra);
    }

    /// Inserts an entry directly, without recording a call.
    pub fn seed(&self, owner: OwnerRef, content: &str, visibility: Visibility) -> EntryId {
        let id = EntryId::new();
        let fields = EntryFields {
            content: content.to_string(),
            visibility,
            stats: DerivedStats::from_content(content),
        };
        self.entries.lock().insert(id, record(id, owner, &fields));
        id
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn get(&self, id: EntryId) -> Option<EntryRecord> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn begin(&self, call: GatewayCall) -> Result<(), GatewayError> {
        let delay = self.latency + self.stalls.lock().pop_front().unwrap_or_default();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.calls.lock().push(call);
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl EntryGateway for MemoryGateway {
    fn create(&self, fields: &EntryFields, owner: &OwnerRef) -> Result<EntryId, GatewayError> {
        self.begin(GatewayCall::Create {
            content: fields.content.clone(),
        })?;
        let id = EntryId::new();
        self.entries
            .lock()
            .insert(id, record(id, owner.clone(), fields));
        Ok(id)
    }

    fn update(&self, id: EntryId, fields: &EntryFields) -> Result<(), GatewayError> {
        self.begin(GatewayCall::Update {
            id,
            content: fields.content.clone(),
        })?;
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(GatewayError::NotFound(id))?;
        entry.content = fields.content.clone();
        entry.visibility = fields.visibility;
        entry.word_count = fields.stats.word_count;
        entry.character_count = fields.stats.char_count;
        entry.updated_at = OffsetDateTime::now_utc().unix_timestamp();
        Ok(())
    }

    fn delete(&self, id: EntryId) -> Result<(), GatewayError> {
        self.begin(GatewayCall::Delete(id))?;
        self.entries
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound(id))
    }
}

fn record(id: EntryId, owner: OwnerRef, fields: &EntryFields) -> EntryRecord {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    EntryRecord {
        id,
        owner_id: owner,
        content: fields.content.clone(),
        visibility: fields.visibility,
        word_count: fields.stats.word_count,
        character_count: fields.stats.char_count,
        created_at: now,
        updated_at: now,
    }
}
