use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::ConversationId,
    error::{ErrorCode, SyncError},
    protocol::OutgoingMessage,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{read_json, remove_key, write_json, KeyValueStore};

pub const FAILED_QUEUE_CAPACITY: usize = 50;
const FAILED_QUEUE_KEY: &str = "failed_operations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub id: Uuid,
    pub payload: OutgoingMessage,
    pub target_conversation_id: ConversationId,
    pub retry_count: u32,
    pub last_error: String,
    pub error_code: ErrorCode,
    pub timestamp: DateTime<Utc>,
}

impl FailedOperation {
    pub fn new(payload: OutgoingMessage, error: &SyncError) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_conversation_id: payload.conversation_id,
            payload,
            retry_count: 0,
            last_error: error.message.clone(),
            error_code: error.code,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded durable FIFO of sends that exhausted their retries.
///
/// Every operation is a read-modify-write of the whole collection under one
/// storage key. Persistence is best-effort: failed writes are logged and the
/// caller carries on.
#[derive(Clone)]
pub struct FailedOperationQueue {
    store: Arc<dyn KeyValueStore>,
}

impl FailedOperationQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Vec<FailedOperation> {
        read_json(self.store.as_ref(), FAILED_QUEUE_KEY).unwrap_or_default()
    }

    fn save(&self, entries: &[FailedOperation]) -> bool {
        write_json(self.store.as_ref(), FAILED_QUEUE_KEY, &entries)
    }

    pub fn add(&self, entry: FailedOperation) {
        let mut entries = self.load();
        while entries.len() >= FAILED_QUEUE_CAPACITY {
            let Some(oldest) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(index, _)| index)
            else {
                break;
            };
            let evicted = entries.remove(oldest);
            info!(
                id = %evicted.id,
                conversation_id = evicted.target_conversation_id.0,
                "storage: evicted oldest failed operation"
            );
        }
        entries.push(entry);
        self.save(&entries);
    }

    pub fn get_all(&self, conversation_id: Option<ConversationId>) -> Vec<FailedOperation> {
        let entries = self.load();
        match conversation_id {
            Some(id) => entries
                .into_iter()
                .filter(|e| e.target_conversation_id == id)
                .collect(),
            None => entries,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<FailedOperation> {
        self.load().into_iter().find(|e| e.id == id)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return false;
        }
        self.save(&entries);
        true
    }

    /// Returns the new count, or `None` when the entry is gone.
    pub fn increment_retry_count(&self, id: Uuid) -> Option<u32> {
        self.modify(id, |entry| entry.retry_count = entry.retry_count.saturating_add(1))
            .map(|entry| entry.retry_count)
    }

    pub fn record_error(&self, id: Uuid, error: &SyncError) -> bool {
        self.modify(id, |entry| {
            entry.last_error = error.message.clone();
            entry.error_code = error.code;
        })
        .is_some()
    }

    pub fn clear(&self) {
        remove_key(self.store.as_ref(), FAILED_QUEUE_KEY);
    }

    fn modify(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut FailedOperation),
    ) -> Option<FailedOperation> {
        let mut entries = self.load();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            warn!(%id, "storage: failed operation not found");
            return None;
        };
        apply(entry);
        let updated = entry.clone();
        self.save(&entries);
        Some(updated)
    }
}

#[cfg(test)]
#[path = "tests/failed_queue_tests.rs"]
mod tests;
