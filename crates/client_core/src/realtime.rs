//! Push-channel adapter.
//!
//! Keeps the set of joined conversations equal to the set the UI shows and
//! folds inbound events into the cache through [`QueryCache::update_where`].
//! Inbound events never trigger a refetch: a refetch racing the event could
//! land server state captured before the event and erase it.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    error::SyncError,
    protocol::{ChatMessage, ConversationSummary, PushEvent, RawPushEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::cache::{CacheValue, QueryCache, QueryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// The push transport. Events arrive on [`PushChannel::subscribe`], in server
/// order per conversation.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self) -> Result<(), SyncError>;
    async fn join_channel(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    async fn leave_channel(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    fn state(&self) -> ConnectionState;
    fn subscribe(&self) -> broadcast::Receiver<RawPushEvent>;
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub connect_recheck_interval: Duration,
    pub connect_recheck_attempts: u32,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_recheck_interval: Duration::from_millis(1000),
            connect_recheck_attempts: 10,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub joined: Vec<ConversationId>,
    pub left: Vec<ConversationId>,
    /// Set when the channel was not connected and the work was scheduled.
    pub deferred: bool,
}

#[derive(Default)]
struct Subscriptions {
    joined: HashSet<ConversationId>,
    desired: HashSet<ConversationId>,
}

pub struct RealtimeAdapter {
    cache: Arc<QueryCache>,
    channel: Arc<dyn PushChannel>,
    viewer_id: UserId,
    options: RealtimeOptions,
    subscriptions: tokio::sync::Mutex<Subscriptions>,
    deferred: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RealtimeAdapter {
    pub fn new(
        cache: Arc<QueryCache>,
        channel: Arc<dyn PushChannel>,
        viewer_id: UserId,
        options: RealtimeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            channel,
            viewer_id,
            options,
            subscriptions: tokio::sync::Mutex::new(Subscriptions::default()),
            deferred: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    /// Starts folding channel events into the cache. Safe before the channel
    /// is connected; events are buffered by the subscription.
    pub fn start(self: &Arc<Self>) {
        let mut listener = lock(&self.listener);
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut events = self.channel.subscribe();
        let adapter = Arc::clone(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(raw) => adapter.handle_raw(&raw),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: dropped push events, invalidating lists");
                        for key in adapter.cache.keys_where(QueryKey::is_conversation_list) {
                            adapter.cache.invalidate(&key);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("realtime: push channel closed");
        }));
    }

    pub fn handle_raw(&self, raw: &RawPushEvent) {
        match PushEvent::parse(raw) {
            Ok(event) => self.apply_event(&event),
            Err(err) => warn!(error = %err, "realtime: ignoring push event"),
        }
    }

    pub fn apply_event(&self, event: &PushEvent) {
        match event {
            PushEvent::MessageSent { message } => {
                let viewer = self.viewer_id;
                let changed = self.cache.update_where(QueryKey::is_conversation_list, |_, value| {
                    let CacheValue::Conversations(list) = value else {
                        return None;
                    };
                    apply_message_sent(list, message, viewer).map(CacheValue::Conversations)
                });
                self.cache
                    .update(&QueryKey::Messages(message.conversation_id), |value| {
                        let CacheValue::Messages(messages) = value else {
                            return None;
                        };
                        append_message(messages, message).map(CacheValue::Messages)
                    });
                debug!(
                    conversation_id = message.conversation_id.0,
                    message_id = message.message_id.0,
                    lists = changed.len(),
                    "realtime: applied message sent"
                );
            }
            PushEvent::MessageRead {
                conversation_id,
                reader_id,
            } => {
                if *reader_id != self.viewer_id {
                    return;
                }
                self.cache.update_where(QueryKey::is_conversation_list, |_, value| {
                    let CacheValue::Conversations(list) = value else {
                        return None;
                    };
                    apply_message_read(list, *conversation_id).map(CacheValue::Conversations)
                });
            }
        }
    }

    /// Joins conversations that became visible and leaves the ones that did
    /// not stay visible. When the channel is not connected yet the desired set
    /// is remembered and a bounded re-check is scheduled.
    pub async fn reconcile(
        self: &Arc<Self>,
        visible: HashSet<ConversationId>,
    ) -> ReconcileOutcome {
        self.subscriptions.lock().await.desired = visible;
        if self.channel.state() != ConnectionState::Connected {
            self.schedule_deferred();
            return ReconcileOutcome {
                deferred: true,
                ..ReconcileOutcome::default()
            };
        }
        self.sync_subscriptions().await
    }

    async fn sync_subscriptions(&self) -> ReconcileOutcome {
        let mut subs = self.subscriptions.lock().await;
        let mut to_join: Vec<_> = subs.desired.difference(&subs.joined).copied().collect();
        let mut to_leave: Vec<_> = subs.joined.difference(&subs.desired).copied().collect();
        to_join.sort();
        to_leave.sort();

        let mut outcome = ReconcileOutcome::default();
        for id in to_join {
            match self.channel.join_channel(id).await {
                Ok(()) => {
                    info!(conversation_id = id.0, "realtime: joined conversation");
                    subs.joined.insert(id);
                    outcome.joined.push(id);
                }
                Err(err) => {
                    warn!(conversation_id = id.0, error = %err, "realtime: join failed");
                }
            }
        }
        for id in to_leave {
            if let Err(err) = self.channel.leave_channel(id).await {
                warn!(conversation_id = id.0, error = %err, "realtime: leave failed");
            } else {
                info!(conversation_id = id.0, "realtime: left conversation");
            }
            subs.joined.remove(&id);
            outcome.left.push(id);
        }
        outcome
    }

    fn schedule_deferred(self: &Arc<Self>) {
        let mut deferred = lock(&self.deferred);
        if deferred.as_ref().is_some_and(|task| !task.is_finished()) {
            // the pending re-check picks up the newest desired set
            return;
        }
        let adapter = Arc::clone(self);
        let interval = self.options.connect_recheck_interval;
        let attempts = self.options.connect_recheck_attempts;
        *deferred = Some(tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(interval).await;
                if adapter.channel.state() == ConnectionState::Connected {
                    debug!(attempt, "realtime: channel connected, running deferred reconcile");
                    adapter.sync_subscriptions().await;
                    return;
                }
            }
            warn!(attempts, "realtime: channel never connected, subscriptions not joined");
        }));
    }

    pub fn has_deferred_reconcile(&self) -> bool {
        lock(&self.deferred)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn joined(&self) -> HashSet<ConversationId> {
        self.subscriptions.lock().await.joined.clone()
    }

    /// Leaves every joined conversation and stops background work.
    pub async fn teardown(&self) {
        if let Some(task) = lock(&self.deferred).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
        let mut subs = self.subscriptions.lock().await;
        let mut joined: Vec<_> = subs.joined.drain().collect();
        joined.sort();
        for id in joined {
            if let Err(err) = self.channel.leave_channel(id).await {
                warn!(conversation_id = id.0, error = %err, "realtime: leave on teardown failed");
            }
        }
        subs.desired.clear();
    }
}

/// Replaces the last-message preview of the owning conversation and bumps its
/// unread counter unless the viewer sent it or the event repeats the current
/// preview. `None` when nothing changes.
pub fn apply_message_sent(
    list: &[ConversationSummary],
    message: &ChatMessage,
    viewer_id: UserId,
) -> Option<Vec<ConversationSummary>> {
    let index = list
        .iter()
        .position(|c| c.conversation_id == message.conversation_id)?;
    let duplicate = list[index]
        .last_message
        .as_ref()
        .is_some_and(|last| last.message_id == message.message_id);
    if duplicate {
        return None;
    }

    let mut next = list.to_vec();
    let conversation = &mut next[index];
    conversation.last_message = Some(message.preview());
    conversation.updated_at = message.sent_at;
    if message.sender_id != viewer_id {
        conversation.unread_count = conversation.unread_count.saturating_add(1);
    }
    Some(next)
}

pub fn apply_message_read(
    list: &[ConversationSummary],
    conversation_id: ConversationId,
) -> Option<Vec<ConversationSummary>> {
    let index = list
        .iter()
        .position(|c| c.conversation_id == conversation_id && c.unread_count != 0)?;
    let mut next = list.to_vec();
    next[index].unread_count = 0;
    Some(next)
}

pub fn append_message(messages: &[ChatMessage], message: &ChatMessage) -> Option<Vec<ChatMessage>> {
    if messages.iter().any(|m| m.message_id == message.message_id) {
        return None;
    }
    let mut next = messages.to_vec();
    next.push(message.clone());
    Some(next)
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
