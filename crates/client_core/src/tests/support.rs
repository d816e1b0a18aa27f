#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, FileId, MemberRole, MessageId, UserId},
    error::SyncError,
    protocol::{
        ChatMessage, ConversationSummary, FileRef, FileUpload, GroupMember, OutgoingMessage,
        RawPushEvent,
    },
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ConversationFilter,
    realtime::{ConnectionState, PushChannel},
    remote::RemoteApi,
};

pub(crate) fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn conversation(id: i64, unread: u32) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        kind: ConversationKind::Group,
        title: format!("conversation {id}"),
        last_message: None,
        unread_count: unread,
        updated_at: at(0),
    }
}

pub(crate) fn message(id: i64, conversation_id: i64, sender: i64, sent_at_ms: i64) -> ChatMessage {
    ChatMessage {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender),
        sender_name: None,
        content: format!("message {id}"),
        attachments: Vec::new(),
        sent_at: at(sent_at_ms),
    }
}

pub(crate) fn member(user_id: i64, role: MemberRole) -> GroupMember {
    GroupMember {
        user_id: UserId(user_id),
        display_name: format!("user {user_id}"),
        role,
    }
}

/// Scriptable in-process server. Write calls consume scripted failures first;
/// reads never fail. Every call fails with `aborted` once its token fires.
#[derive(Default)]
pub(crate) struct MockRemoteApi {
    pub conversations: Mutex<Vec<ConversationSummary>>,
    pub members: Mutex<HashMap<ConversationId, Vec<GroupMember>>>,
    pub messages: Mutex<HashMap<ConversationId, Vec<ChatMessage>>>,
    failures: Mutex<VecDeque<SyncError>>,
    fail_always: Mutex<Option<SyncError>>,
    read_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<&'static str>>,
    next_id: AtomicI64,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        }
    }

    pub fn with_conversations(self, conversations: Vec<ConversationSummary>) -> Self {
        *self.conversations.lock().unwrap() = conversations;
        self
    }

    pub fn with_members(self, conversation_id: i64, members: Vec<GroupMember>) -> Self {
        self.members
            .lock()
            .unwrap()
            .insert(ConversationId(conversation_id), members);
        self
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn fail_always(&self, error: SyncError) {
        *self.fail_always.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.fail_always.lock().unwrap() = None;
        self.failures.lock().unwrap().clear();
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }

    async fn wait(&self, delay: Option<Duration>, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::aborted());
        }
        let Some(delay) = delay else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::aborted()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn begin_read(&self, name: &'static str, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.record(name);
        let delay = *self.read_delay.lock().unwrap();
        self.wait(delay, cancel).await
    }

    async fn begin_write(&self, name: &'static str, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.record(name);
        let delay = *self.write_delay.lock().unwrap();
        self.wait(delay, cancel).await?;
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.fail_always.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn list_conversations(
        &self,
        _filter: ConversationFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        self.begin_read("list_conversations", cancel).await?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_group_members(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupMember>, SyncError> {
        self.begin_read("list_group_members", cancel).await?;
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        self.begin_read("list_messages", cancel).await?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.begin_write("mark_conversation_read", cancel).await?;
        for c in self.conversations.lock().unwrap().iter_mut() {
            if c.conversation_id == conversation_id {
                c.unread_count = 0;
            }
        }
        Ok(())
    }

    async fn add_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        self.begin_write("add_group_member", cancel).await?;
        let added = member(user_id.0, MemberRole::Member);
        self.members
            .lock()
            .unwrap()
            .entry(conversation_id)
            .or_default()
            .push(added.clone());
        Ok(added)
    }

    async fn remove_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.begin_write("remove_group_member", cancel).await?;
        if let Some(members) = self.members.lock().unwrap().get_mut(&conversation_id) {
            members.retain(|m| m.user_id != user_id);
        }
        Ok(())
    }

    async fn promote_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        self.begin_write("promote_group_member", cancel).await?;
        let mut members = self.members.lock().unwrap();
        let promoted = members
            .get_mut(&conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.user_id == user_id))
            .map(|m| {
                m.role = MemberRole::Admin;
                m.clone()
            });
        Ok(promoted.unwrap_or_else(|| member(user_id.0, MemberRole::Admin)))
    }

    async fn send_message(
        &self,
        outgoing: &OutgoingMessage,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage, SyncError> {
        self.begin_write("send_message", cancel).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sent = ChatMessage {
            message_id: MessageId(id),
            conversation_id: outgoing.conversation_id,
            sender_id: UserId(1),
            sender_name: None,
            content: outgoing.content.clone(),
            attachments: outgoing.attachments.clone(),
            sent_at: Utc::now(),
        };
        self.messages
            .lock()
            .unwrap()
            .entry(outgoing.conversation_id)
            .or_default()
            .push(sent.clone());
        Ok(sent)
    }

    async fn upload_file(
        &self,
        upload: &FileUpload,
        cancel: &CancellationToken,
    ) -> Result<FileRef, SyncError> {
        self.begin_write("upload_file", cancel).await?;
        Ok(FileRef {
            file_id: FileId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            filename: upload.filename.clone(),
            size_bytes: upload.bytes.len() as u64,
            mime_type: Some(upload.mime_type.clone()),
        })
    }
}

/// Push channel driven by the test: state is set by hand and events are
/// injected with [`MockPushChannel::push`].
pub(crate) struct MockPushChannel {
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<RawPushEvent>,
    joins: Mutex<Vec<ConversationId>>,
    leaves: Mutex<Vec<ConversationId>>,
    failing_joins: Mutex<Vec<ConversationId>>,
}

impl MockPushChannel {
    pub fn new(state: ConnectionState) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(state),
            events,
            joins: Mutex::new(Vec::new()),
            leaves: Mutex::new(Vec::new()),
            failing_joins: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_join(&self, conversation_id: i64) {
        self.failing_joins
            .lock()
            .unwrap()
            .push(ConversationId(conversation_id));
    }

    pub fn push(&self, event: RawPushEvent) {
        let _ = self.events.send(event);
    }

    pub fn joins(&self) -> Vec<ConversationId> {
        self.joins.lock().unwrap().clone()
    }

    pub fn leaves(&self) -> Vec<ConversationId> {
        self.leaves.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushChannel for MockPushChannel {
    async fn connect(&self) -> Result<(), SyncError> {
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn join_channel(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.joins.lock().unwrap().push(conversation_id);
        if self.failing_joins.lock().unwrap().contains(&conversation_id) {
            return Err(SyncError::offline());
        }
        Ok(())
    }

    async fn leave_channel(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.leaves.lock().unwrap().push(conversation_id);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> broadcast::Receiver<RawPushEvent> {
        self.events.subscribe()
    }
}
