use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, UserId},
    error::{ErrorCode, FailureSignal, SyncError},
    protocol::{ChatMessage, ConversationSummary, FileRef, FileUpload, GroupMember, OutgoingMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::cache::ConversationFilter;

/// Offline sensor shared by everything that talks to the server.
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

/// Remote call layer. Every call observes `cancel`: once it fires the request
/// is dropped and the call fails with [`SyncError::aborted`].
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationSummary>, SyncError>;
    async fn list_group_members(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupMember>, SyncError>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, SyncError>;
    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>;
    async fn add_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError>;
    async fn remove_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>;
    async fn promote_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError>;
    async fn send_message(
        &self,
        message: &OutgoingMessage,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage, SyncError>;
    async fn upload_file(
        &self,
        upload: &FileUpload,
        cancel: &CancellationToken,
    ) -> Result<FileRef, SyncError>;
}

#[derive(Serialize)]
struct AddMemberRequest {
    user_id: i64,
}

pub struct HttpRemoteApi {
    http: Client,
    base_url: String,
    bearer_token: Option<String>,
    connectivity: Connectivity,
}

impl HttpRemoteApi {
    pub fn new(server_url: &str, connectivity: Connectivity) -> Result<Self, SyncError> {
        let parsed = Url::parse(server_url).map_err(|err| {
            SyncError::new(
                ErrorCode::BadRequest,
                format!("invalid server url '{server_url}': {err}"),
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyncError::new(
                ErrorCode::BadRequest,
                "server_url must start with http:// or https://",
            ));
        }
        Ok(Self {
            http: Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
            bearer_token: None,
            connectivity,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        Err(SyncError::from_signal(
            FailureSignal::Status(status.as_u16()),
            detail,
        ))
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::offline());
        }
        let call = async {
            let response = self.dispatch(request).await?;
            response.json::<T>().await.map_err(|err| {
                SyncError::new(ErrorCode::Unknown, format!("invalid response body: {err}"))
            })
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("remote: request aborted by cancellation token");
                Err(SyncError::aborted())
            }
            result = call => result,
        }
    }

    async fn call_unit(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::offline());
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("remote: request aborted by cancellation token");
                Err(SyncError::aborted())
            }
            result = self.dispatch(request) => result.map(|_| ()),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    let signal = if err.is_timeout() {
        FailureSignal::Aborted
    } else if let Some(status) = err.status() {
        FailureSignal::Status(status.as_u16())
    } else if err.is_connect() || err.is_request() {
        FailureSignal::Transport
    } else {
        FailureSignal::Other
    };
    SyncError::from_signal(signal, err.to_string())
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let request = self
            .http
            .get(self.endpoint("conversations"))
            .query(&[("filter", filter.as_str())]);
        self.call_json(request, cancel).await
    }

    async fn list_group_members(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupMember>, SyncError> {
        let request = self
            .http
            .get(self.endpoint(&format!("conversations/{conversation_id}/members")));
        self.call_json(request, cancel).await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        let request = self
            .http
            .get(self.endpoint(&format!("conversations/{conversation_id}/messages")));
        self.call_json(request, cancel).await
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.endpoint(&format!("conversations/{conversation_id}/read")));
        self.call_unit(request, cancel).await
    }

    async fn add_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        let request = self
            .http
            .post(self.endpoint(&format!("conversations/{conversation_id}/members")))
            .json(&AddMemberRequest { user_id: user_id.0 });
        self.call_json(request, cancel).await
    }

    async fn remove_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let request = self.http.delete(self.endpoint(&format!(
            "conversations/{conversation_id}/members/{user_id}"
        )));
        self.call_unit(request, cancel).await
    }

    async fn promote_group_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        let request = self.http.post(self.endpoint(&format!(
            "conversations/{conversation_id}/members/{user_id}/promote"
        )));
        self.call_json(request, cancel).await
    }

    async fn send_message(
        &self,
        message: &OutgoingMessage,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage, SyncError> {
        let request = self
            .http
            .post(self.endpoint(&format!(
                "conversations/{}/messages",
                message.conversation_id
            )))
            .json(message);
        self.call_json(request, cancel).await
    }

    async fn upload_file(
        &self,
        upload: &FileUpload,
        cancel: &CancellationToken,
    ) -> Result<FileRef, SyncError> {
        let request = self
            .http
            .post(self.endpoint("files"))
            .query(&[
                ("conversation_id", upload.conversation_id.to_string()),
                ("filename", upload.filename.clone()),
                ("mime_type", upload.mime_type.clone()),
            ])
            .body(upload.bytes.clone());
        self.call_json(request, cancel).await
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
