use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ConversationId, ConversationKind, FileId, MemberRole, MessageId, UserId};

pub const MESSAGE_SENT_EVENT: &str = "messageSent";
pub const MESSAGE_READ_EVENT: &str = "messageRead";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileRef>,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            message_id: self.message_id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            has_attachments: !self.attachments.is_empty(),
            sent_at: self.sent_at,
        }
    }
}

/// The last-message summary shown in conversation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub has_attachments: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub user_id: UserId,
    pub display_name: String,
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileRef>,
}

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub conversation_id: ConversationId,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// An event as delivered by the push channel, before narrowing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPushEvent {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawPushEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    MessageSent {
        message: ChatMessage,
    },
    MessageRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
}

#[derive(Debug, Error)]
pub enum PushEventError {
    #[error("unknown push event '{0}'")]
    UnknownEvent(String),
    #[error("malformed '{event}' payload: {source}")]
    Malformed {
        event: String,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct MessageReadPayload {
    conversation_id: ConversationId,
    reader_id: UserId,
}

impl PushEvent {
    pub fn parse(raw: &RawPushEvent) -> Result<Self, PushEventError> {
        let malformed = |source| PushEventError::Malformed {
            event: raw.event.clone(),
            source,
        };
        match raw.event.as_str() {
            MESSAGE_SENT_EVENT => {
                let message = serde_json::from_value::<ChatMessage>(raw.payload.clone())
                    .map_err(malformed)?;
                Ok(Self::MessageSent { message })
            }
            MESSAGE_READ_EVENT => {
                let payload = serde_json::from_value::<MessageReadPayload>(raw.payload.clone())
                    .map_err(malformed)?;
                Ok(Self::MessageRead {
                    conversation_id: payload.conversation_id,
                    reader_id: payload.reader_id,
                })
            }
            other => Err(PushEventError::UnknownEvent(other.to_string())),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::MessageSent { message } => message.conversation_id,
            Self::MessageRead {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}
