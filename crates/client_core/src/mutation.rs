//! Optimistic mutation protocol.
//!
//! A mutation moves `Idle -> Pending -> Committed | RolledBack`. On start it
//! cancels in-flight fetches for its keys, snapshots them and writes the
//! speculative value in the same cache transaction. On success the keys are
//! invalidated and refetched; on failure every snapshot is put back verbatim.
//! Keys the mutation left untouched are not snapshotted, so writes that land
//! on them while the call is pending survive a rollback.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use shared::error::SyncError;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheValue, FetchOutcome, QueryCache, QueryKey},
    remote::RemoteApi,
    retry::{retry_with_backoff, RetryPolicy},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error("a conflicting mutation is already pending on {0}")]
    Busy(QueryKey),
    #[error(transparent)]
    Remote(#[from] SyncError),
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub mutation_id: Uuid,
    pub name: &'static str,
    pub affected_keys: Vec<QueryKey>,
    /// Captured in the same cache transaction as the speculative write, only
    /// for keys that received one.
    pub snapshot: Vec<(QueryKey, Option<CacheValue>)>,
    pub speculative_value: Vec<(QueryKey, CacheValue)>,
    pub status: MutationStatus,
}

#[async_trait]
pub trait OptimisticMutation: Send + Sync + 'static {
    type Variables: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn affected_keys(&self, cache: &QueryCache, variables: &Self::Variables) -> Vec<QueryKey>;

    /// The guessed next value for `key`, or `None` to leave it alone.
    fn speculate(
        &self,
        key: &QueryKey,
        current: &CacheValue,
        variables: &Self::Variables,
    ) -> Option<CacheValue>;

    /// Exclusive mutations are not safe to overlap on the same key.
    fn exclusive(&self) -> bool {
        true
    }

    /// Only idempotent remote calls should return a policy.
    fn retry_policy(&self) -> Option<RetryPolicy<SyncError>> {
        None
    }

    async fn execute(
        &self,
        remote: &dyn RemoteApi,
        variables: &Self::Variables,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, SyncError>;
}

/// Owns the cache, the remote layer and the registry of exclusive pending keys.
pub struct QueryClient {
    cache: Arc<QueryCache>,
    remote: Arc<dyn RemoteApi>,
    pending: Mutex<HashMap<QueryKey, Uuid>>,
    events: broadcast::Sender<ClientEvent>,
}

struct PendingKeys<'a> {
    registry: &'a Mutex<HashMap<QueryKey, Uuid>>,
    keys: Vec<QueryKey>,
}

impl Drop for PendingKeys<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            registry.remove(key);
        }
    }
}

impl QueryClient {
    pub fn new(cache: Arc<QueryCache>, remote: Arc<dyn RemoteApi>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            cache,
            remote,
            pending: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<QueryKey, Uuid>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_pending_mutation(&self, key: &QueryKey) -> bool {
        self.pending().contains_key(key)
    }

    /// Loads `key` from the server into the cache.
    pub async fn fetch_query(&self, key: QueryKey) -> Result<FetchOutcome, SyncError> {
        let remote = Arc::clone(&self.remote);
        self.cache
            .fetch(key, move |cancel| async move {
                load(remote.as_ref(), key, &cancel).await
            })
            .await
    }

    pub async fn refetch(&self, key: QueryKey) {
        if let Err(err) = self.fetch_query(key).await {
            warn!(key = %key, error = %err, "mutation: refetch after commit failed");
        }
    }

    fn claim_keys(&self, keys: &[QueryKey], mutation_id: Uuid) -> Result<PendingKeys<'_>, MutationError> {
        let mut registry = self.pending();
        if let Some(busy) = keys.iter().find(|key| registry.contains_key(*key)) {
            return Err(MutationError::Busy(*busy));
        }
        for key in keys {
            registry.insert(*key, mutation_id);
        }
        Ok(PendingKeys {
            registry: &self.pending,
            keys: keys.to_vec(),
        })
    }

    pub async fn run<M: OptimisticMutation>(
        &self,
        mutation: &M,
        variables: M::Variables,
    ) -> Result<M::Output, MutationError> {
        let mutation_id = Uuid::new_v4();
        let affected_keys = mutation.affected_keys(&self.cache, &variables);
        let _claim = if mutation.exclusive() {
            Some(self.claim_keys(&affected_keys, mutation_id)?)
        } else {
            None
        };

        let mut record = MutationRecord {
            mutation_id,
            name: mutation.name(),
            affected_keys: affected_keys.clone(),
            snapshot: Vec::with_capacity(affected_keys.len()),
            speculative_value: Vec::new(),
            status: MutationStatus::Idle,
        };

        for key in &affected_keys {
            self.cache.cancel_fetches(key);
            let mut snapshot = None;
            let mut speculative = None;
            self.cache.update(key, |current| {
                snapshot = Some(current.clone());
                speculative = mutation.speculate(key, current, &variables);
                speculative.clone()
            });
            if let Some(value) = speculative {
                record.snapshot.push((*key, snapshot));
                record.speculative_value.push((*key, value));
            }
        }
        record.status = MutationStatus::Pending;
        info!(
            mutation = record.name,
            %mutation_id,
            keys = record.affected_keys.len(),
            "mutation: applied speculative write"
        );

        let cancel = CancellationToken::new();
        let remote = self.remote.as_ref();
        let vars = &variables;
        let token = &cancel;
        let result = match mutation.retry_policy() {
            Some(policy) => {
                retry_with_backoff(move || mutation.execute(remote, vars, token), &policy).await
            }
            None => mutation.execute(remote, vars, token).await,
        };

        match result {
            Ok(output) => {
                record.status = MutationStatus::Committed;
                for key in &record.affected_keys {
                    self.cache.invalidate(key);
                }
                for key in &record.affected_keys {
                    self.refetch(*key).await;
                }
                self.settle(&record);
                Ok(output)
            }
            Err(err) => {
                for (key, snapshot) in record.snapshot.drain(..) {
                    self.cache.restore(key, snapshot);
                }
                record.status = MutationStatus::RolledBack;
                warn!(
                    mutation = record.name,
                    %mutation_id,
                    code = ?err.code,
                    error = %err,
                    "mutation: remote call failed, rolled back"
                );
                self.emit(ClientEvent::Error {
                    code: err.code,
                    message: err.user_message().to_string(),
                });
                self.settle(&record);
                Err(MutationError::Remote(err))
            }
        }
    }

    fn settle(&self, record: &MutationRecord) {
        self.emit(ClientEvent::MutationSettled {
            mutation_id: record.mutation_id,
            name: record.name,
            status: record.status,
        });
    }
}

async fn load(
    remote: &dyn RemoteApi,
    key: QueryKey,
    cancel: &CancellationToken,
) -> Result<CacheValue, SyncError> {
    match key {
        QueryKey::Conversations(filter) => remote
            .list_conversations(filter, cancel)
            .await
            .map(CacheValue::Conversations),
        QueryKey::GroupMembers(id) => remote
            .list_group_members(id, cancel)
            .await
            .map(CacheValue::Members),
        QueryKey::Messages(id) => remote
            .list_messages(id, cancel)
            .await
            .map(CacheValue::Messages),
    }
}

struct HandleState<T> {
    status: MutationStatus,
    data: Option<T>,
    error: Option<MutationError>,
}

/// `{ mutate, is_pending, is_error, data }` surface for one mutation kind.
pub struct MutationHandle<M: OptimisticMutation> {
    client: Arc<QueryClient>,
    mutation: Arc<M>,
    state: Mutex<HandleState<M::Output>>,
}

impl<M: OptimisticMutation> MutationHandle<M> {
    pub fn new(client: Arc<QueryClient>, mutation: M) -> Self {
        Self {
            client,
            mutation: Arc::new(mutation),
            state: Mutex::new(HandleState {
                status: MutationStatus::Idle,
                data: None,
                error: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState<M::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn mutate(&self, variables: M::Variables) -> Result<M::Output, MutationError> {
        let (previous_status, previous_error) = {
            let mut state = self.state();
            let previous = (state.status, state.error.take());
            state.status = MutationStatus::Pending;
            previous
        };
        let result = self.client.run(self.mutation.as_ref(), variables).await;
        let mut state = self.state();
        match &result {
            Ok(output) => {
                state.status = MutationStatus::Committed;
                state.data = Some(output.clone());
            }
            // rejected before anything ran; a call already in flight keeps its state
            Err(MutationError::Busy(_)) => {
                state.status = previous_status;
                state.error = previous_error;
            }
            Err(err) => {
                state.status = MutationStatus::RolledBack;
                state.error = Some(err.clone());
            }
        }
        result
    }

    pub fn status(&self) -> MutationStatus {
        self.state().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == MutationStatus::Pending
    }

    pub fn is_error(&self) -> bool {
        self.state().error.is_some()
    }

    pub fn data(&self) -> Option<M::Output> {
        self.state().data.clone()
    }

    pub fn error(&self) -> Option<MutationError> {
        self.state().error.clone()
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.status = MutationStatus::Idle;
        state.data = None;
        state.error = None;
    }
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;
