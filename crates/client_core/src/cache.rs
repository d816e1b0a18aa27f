//! Query-keyed state cache shared by every component of the client.
//!
//! All reads hand out clones; all writes go through [`QueryCache::set`],
//! [`QueryCache::update`] or [`QueryCache::update_where`], which run the
//! transform against the current value under the cache lock and notify
//! subscribers before returning. Transforms must not call back into the cache.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    error::SyncError,
    protocol::{ChatMessage, ConversationSummary, GroupMember},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationFilter {
    All,
    Direct,
    Group,
    Unread,
}

impl ConversationFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Unread => "unread",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Conversations(ConversationFilter),
    GroupMembers(ConversationId),
    Messages(ConversationId),
}

impl QueryKey {
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Conversations(_) => "conversations",
            Self::GroupMembers(_) => "group_members",
            Self::Messages(_) => "messages",
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::Conversations(_) => None,
            Self::GroupMembers(id) | Self::Messages(id) => Some(*id),
        }
    }

    pub fn is_conversation_list(&self) -> bool {
        matches!(self, Self::Conversations(_))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversations(filter) => write!(f, "conversations/{}", filter.as_str()),
            Self::GroupMembers(id) => write!(f, "group_members/{id}"),
            Self::Messages(id) => write!(f, "messages/{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Conversations(Vec<ConversationSummary>),
    Members(Vec<GroupMember>),
    Messages(Vec<ChatMessage>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub revision: u64,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated { key: QueryKey, revision: u64 },
    Invalidated { key: QueryKey },
    Removed { key: QueryKey },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Stored(CacheValue),
    /// The fetch was cancelled or superseded; its result was not written.
    Discarded,
}

struct InflightFetch {
    id: u64,
    token: CancellationToken,
}

/// Frees the in-flight slot if the fetch future is dropped before it finishes.
struct InflightSlot<'a> {
    cache: &'a QueryCache,
    key: QueryKey,
    id: u64,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.state();
        if state
            .inflight
            .get(&self.key)
            .is_some_and(|inflight| inflight.id == self.id)
        {
            state.inflight.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, CacheEntry>,
    inflight: HashMap<QueryKey, InflightFetch>,
    next_revision: u64,
    next_fetch_id: u64,
}

impl CacheState {
    fn write(&mut self, key: QueryKey, value: CacheValue) -> u64 {
        self.next_revision += 1;
        let revision = self.next_revision;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                revision,
                stale: false,
                updated_at: Utc::now(),
            },
        );
        revision
    }
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(CacheState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheValue> {
        self.state().entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.state().entries.get(key).cloned()
    }

    pub fn keys_where(&self, predicate: impl Fn(&QueryKey) -> bool) -> Vec<QueryKey> {
        self.state()
            .entries
            .keys()
            .filter(|k| predicate(k))
            .copied()
            .collect()
    }

    pub fn set(&self, key: QueryKey, value: CacheValue) -> u64 {
        let mut state = self.state();
        let revision = state.write(key, value);
        self.emit(CacheEvent::Updated { key, revision });
        revision
    }

    /// Read-transform-write of one entry. Absent entries are left absent and a
    /// transform returning `None` leaves the entry untouched.
    pub fn update(
        &self,
        key: &QueryKey,
        transform: impl FnOnce(&CacheValue) -> Option<CacheValue>,
    ) -> Option<u64> {
        let mut state = self.state();
        let next = transform(&state.entries.get(key)?.value)?;
        let revision = state.write(*key, next);
        self.emit(CacheEvent::Updated { key: *key, revision });
        Some(revision)
    }

    /// Applies `transform` to every entry whose key matches, returning the keys
    /// that changed.
    pub fn update_where(
        &self,
        predicate: impl Fn(&QueryKey) -> bool,
        mut transform: impl FnMut(&QueryKey, &CacheValue) -> Option<CacheValue>,
    ) -> Vec<QueryKey> {
        let mut state = self.state();
        let changes: Vec<(QueryKey, CacheValue)> = state
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .filter_map(|(key, entry)| transform(key, &entry.value).map(|v| (*key, v)))
            .collect();

        let mut changed = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            let revision = state.write(key, value);
            self.emit(CacheEvent::Updated { key, revision });
            changed.push(key);
        }
        changed
    }

    /// Puts a snapshot back. A `None` snapshot means the entry did not exist
    /// when it was taken, so there is nothing to restore.
    pub fn restore(&self, key: QueryKey, snapshot: Option<CacheValue>) -> Option<u64> {
        snapshot.map(|value| self.set(key, value))
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheValue> {
        let removed = self.state().entries.remove(key).map(|e| e.value);
        if removed.is_some() {
            self.emit(CacheEvent::Removed { key: *key });
        }
        removed
    }

    /// Tells subscribers to re-read `key` without changing or refetching it.
    pub fn notify(&self, key: &QueryKey) {
        let revision = self.state().entries.get(key).map(|e| e.revision);
        if let Some(revision) = revision {
            self.emit(CacheEvent::Updated {
                key: *key,
                revision,
            });
        }
    }

    /// Marks `key` stale and announces it so an owner can refetch.
    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(entry) = self.state().entries.get_mut(key) {
            entry.stale = true;
        }
        self.emit(CacheEvent::Invalidated { key: *key });
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.state().inflight.contains_key(key)
    }

    /// Cancels the in-flight fetch for `key`, if any. Its result is discarded.
    pub fn cancel_fetches(&self, key: &QueryKey) -> bool {
        let inflight = self.state().inflight.remove(key);
        match inflight {
            Some(fetch) => {
                debug!(key = %key, "cache: cancelled in-flight fetch");
                fetch.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs `fetcher` as the single in-flight fetch for `key`, superseding any
    /// previous one, and stores its result unless it was cancelled meanwhile.
    pub async fn fetch<F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<FetchOutcome, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<CacheValue, SyncError>>,
    {
        let token = CancellationToken::new();
        let fetch_id = {
            let mut state = self.state();
            state.next_fetch_id += 1;
            let id = state.next_fetch_id;
            if let Some(previous) = state.inflight.insert(
                key,
                InflightFetch {
                    id,
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
            id
        };
        let _slot = InflightSlot {
            cache: self,
            key,
            id: fetch_id,
        };

        let result = fetcher(token.clone()).await;

        let mut state = self.state();
        let still_current = state
            .inflight
            .get(&key)
            .is_some_and(|inflight| inflight.id == fetch_id);
        if still_current {
            state.inflight.remove(&key);
        }
        if token.is_cancelled() || !still_current {
            debug!(key = %key, "cache: discarded superseded fetch result");
            return Ok(FetchOutcome::Discarded);
        }

        let value = result?;
        let revision = state.write(key, value.clone());
        self.emit(CacheEvent::Updated { key, revision });
        Ok(FetchOutcome::Stored(value))
    }

    fn emit(&self, event: CacheEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
