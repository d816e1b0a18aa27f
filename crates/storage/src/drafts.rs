use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{domain::ConversationId, protocol::FileRef};

use crate::{read_json, remove_key, write_json, KeyValueStore};

const DRAFTS_KEY: &str = "drafts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default)]
    pub attached_file_refs: Vec<FileRef>,
    pub last_modified: DateTime<Utc>,
}

impl Draft {
    pub fn new(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            attached_file_refs: Vec::new(),
            last_modified: Utc::now(),
        }
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.attached_file_refs = files;
        self
    }
}

/// One unsent draft per conversation. Drafts never expire.
#[derive(Clone)]
pub struct DraftStore {
    store: Arc<dyn KeyValueStore>,
}

impl DraftStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Vec<Draft> {
        read_json(self.store.as_ref(), DRAFTS_KEY).unwrap_or_default()
    }

    pub fn save(&self, draft: Draft) {
        let mut drafts = self.load();
        match drafts
            .iter_mut()
            .find(|d| d.conversation_id == draft.conversation_id)
        {
            Some(existing) => *existing = draft,
            None => drafts.push(draft),
        }
        write_json(self.store.as_ref(), DRAFTS_KEY, &drafts);
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<Draft> {
        self.load()
            .into_iter()
            .find(|d| d.conversation_id == conversation_id)
    }

    pub fn delete(&self, conversation_id: ConversationId) {
        let mut drafts = self.load();
        let before = drafts.len();
        drafts.retain(|d| d.conversation_id != conversation_id);
        if drafts.len() != before {
            write_json(self.store.as_ref(), DRAFTS_KEY, &drafts);
        }
    }

    pub fn clear_all(&self) {
        remove_key(self.store.as_ref(), DRAFTS_KEY);
    }
}

#[cfg(test)]
#[path = "tests/drafts_tests.rs"]
mod tests;
