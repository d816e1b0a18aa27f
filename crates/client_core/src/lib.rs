use std::{sync::Arc, time::Duration};

use shared::{domain::{ConversationId, UserId}, error::ErrorCode};
use storage::{DraftStore, FailedOperationQueue, KeyValueStore};
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod cache;
pub mod config;
pub mod grouping;
pub mod mutation;
pub mod mutations;
pub mod outbox;
pub mod realtime;
pub mod remote;
pub mod retry;
pub mod timeout;

pub use cache::{CacheEvent, CacheValue, ConversationFilter, FetchOutcome, QueryCache, QueryKey};
pub use mutation::{MutationError, MutationHandle, MutationStatus, OptimisticMutation, QueryClient};
pub use mutations::{
    AddGroupMember, MarkConversationRead, MemberRef, NewMember, PromoteGroupMember,
    RemoveGroupMember,
};
pub use outbox::MessageSender;
pub use realtime::{ConnectionState, PushChannel, RealtimeAdapter, RealtimeOptions};
pub use remote::{Connectivity, HttpRemoteApi, RemoteApi};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use timeout::TimeoutController;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A failure the user should see.
    Error { code: ErrorCode, message: String },
    MutationSettled {
        mutation_id: Uuid,
        name: &'static str,
        status: MutationStatus,
    },
    OperationQueued {
        id: Uuid,
        conversation_id: ConversationId,
    },
}

pub struct ClientOptions {
    pub viewer_id: UserId,
    pub request_timeout: Duration,
    pub realtime: RealtimeOptions,
}

impl ClientOptions {
    pub fn from_settings(settings: &config::ClientSettings, fallback_viewer: UserId) -> Self {
        Self {
            viewer_id: settings.viewer_id.unwrap_or(fallback_viewer),
            request_timeout: settings.request_timeout(),
            realtime: settings.realtime_options(),
        }
    }
}

/// Everything a signed-in session needs, wired around one shared cache.
pub struct PortalClient {
    pub queries: Arc<QueryClient>,
    pub realtime: Arc<RealtimeAdapter>,
    pub outbox: MessageSender,
    pub mark_read: MutationHandle<MarkConversationRead>,
    pub add_member: MutationHandle<AddGroupMember>,
    pub remove_member: MutationHandle<RemoveGroupMember>,
    pub promote_member: MutationHandle<PromoteGroupMember>,
}

impl PortalClient {
    pub fn new(
        options: ClientOptions,
        remote: Arc<dyn RemoteApi>,
        channel: Arc<dyn PushChannel>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let cache = Arc::new(QueryCache::new());
        let queries = QueryClient::new(Arc::clone(&cache), remote);
        let realtime = RealtimeAdapter::new(cache, channel, options.viewer_id, options.realtime);
        let outbox = MessageSender::new(
            Arc::clone(&queries),
            FailedOperationQueue::new(Arc::clone(&store)),
            DraftStore::new(store),
            options.request_timeout,
        );
        Self {
            mark_read: MutationHandle::new(Arc::clone(&queries), MarkConversationRead),
            add_member: MutationHandle::new(Arc::clone(&queries), AddGroupMember),
            remove_member: MutationHandle::new(Arc::clone(&queries), RemoveGroupMember),
            promote_member: MutationHandle::new(Arc::clone(&queries), PromoteGroupMember),
            queries,
            realtime,
            outbox,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.queries.cache()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.queries.subscribe_events()
    }

    pub async fn shutdown(&self) {
        self.outbox.abort();
        self.realtime.teardown().await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
