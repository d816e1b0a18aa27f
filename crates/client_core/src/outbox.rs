use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::ConversationId,
    error::{ErrorCode, FailureSignal, SyncError},
    protocol::{ChatMessage, FileRef, FileUpload, OutgoingMessage},
};
use storage::{Draft, DraftStore, FailedOperation, FailedOperationQueue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheValue, QueryKey},
    mutation::QueryClient,
    realtime::{append_message, apply_message_sent},
    retry::{retry_with_backoff, RetryPolicy},
    timeout::TimeoutController,
    ClientEvent,
};

pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

const ALLOWED_MIME_PREFIXES: &[&str] = &["image/", "text/"];
const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/zip",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

pub fn validate_upload(upload: &FileUpload) -> Result<(), SyncError> {
    if upload.bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(SyncError::from_signal(
            FailureSignal::FileTooLarge,
            format!(
                "{} is {} bytes, limit is {MAX_UPLOAD_BYTES}",
                upload.filename,
                upload.bytes.len()
            ),
        ));
    }
    let mime = upload.mime_type.to_ascii_lowercase();
    let allowed = ALLOWED_MIME_PREFIXES.iter().any(|p| mime.starts_with(p))
        || ALLOWED_MIME_TYPES.contains(&mime.as_str());
    if !allowed {
        return Err(SyncError::from_signal(
            FailureSignal::UnsupportedFileType,
            format!("{} has unsupported type {mime}", upload.filename),
        ));
    }
    Ok(())
}

/// Sends messages for one composer. The composer is a single deadline slot:
/// starting a send cancels a send still in flight.
pub struct MessageSender {
    client: Arc<QueryClient>,
    failed: FailedOperationQueue,
    drafts: DraftStore,
    deadline: TimeoutController,
    send_policy: RetryPolicy<SyncError>,
    upload_policy: RetryPolicy<SyncError>,
    /// Bumped by every `abort()` call.
    aborts: AtomicU64,
}

impl MessageSender {
    pub fn new(
        client: Arc<QueryClient>,
        failed: FailedOperationQueue,
        drafts: DraftStore,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            failed,
            drafts,
            deadline: TimeoutController::new(timeout),
            send_policy: RetryPolicy::message_send(),
            upload_policy: RetryPolicy::file_upload(),
            aborts: AtomicU64::new(0),
        }
    }

    pub fn with_policies(
        mut self,
        send_policy: RetryPolicy<SyncError>,
        upload_policy: RetryPolicy<SyncError>,
    ) -> Self {
        self.send_policy = send_policy;
        self.upload_policy = upload_policy;
        self
    }

    /// Sends `outgoing`, queueing it for manual retry when it finally fails.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<ChatMessage, SyncError> {
        let aborts = self.aborts.load(Ordering::SeqCst);
        match self.deliver(&outgoing).await {
            Ok(message) => Ok(message),
            Err(err) => {
                let entry = FailedOperation::new(outgoing, &err);
                let (id, conversation_id) = (entry.id, entry.target_conversation_id);
                self.failed.add(entry);
                warn!(
                    %id,
                    conversation_id = conversation_id.0,
                    code = ?err.code,
                    "outbox: send failed, queued for retry"
                );
                self.client.emit(ClientEvent::OperationQueued {
                    id,
                    conversation_id,
                });
                self.surface_unless_aborted(&err, aborts);
                Err(err)
            }
        }
    }

    /// Re-sends a queued operation. It leaves the queue only on success.
    pub async fn retry_failed(&self, id: Uuid) -> Result<ChatMessage, SyncError> {
        let Some(entry) = self.failed.get(id) else {
            return Err(SyncError::new(
                ErrorCode::BadRequest,
                format!("failed operation {id} not found"),
            ));
        };
        self.failed.increment_retry_count(id);
        let aborts = self.aborts.load(Ordering::SeqCst);
        match self.deliver(&entry.payload).await {
            Ok(message) => {
                self.failed.remove(id);
                info!(%id, "outbox: queued operation delivered");
                Ok(message)
            }
            Err(err) => {
                self.failed.record_error(id, &err);
                self.surface_unless_aborted(&err, aborts);
                Err(err)
            }
        }
    }

    async fn deliver(&self, outgoing: &OutgoingMessage) -> Result<ChatMessage, SyncError> {
        let token = self.deadline.start_timeout();
        let policy = {
            let base = self.send_policy.clone();
            let token = token.clone();
            self.send_policy
                .with_should_retry(move |err| !token.is_cancelled() && base.should_retry(err))
        };
        let remote = self.client.remote().as_ref();
        let token_ref = &token;
        let result =
            retry_with_backoff(move || remote.send_message(outgoing, token_ref), &policy).await;
        // a cancelled token means this send was superseded, timed out or aborted
        if !token.is_cancelled() {
            self.deadline.cancel_timeout();
        }

        let message = result?;
        self.drafts.delete(outgoing.conversation_id);
        self.record_sent(&message);
        Ok(message)
    }

    fn record_sent(&self, message: &ChatMessage) {
        let cache = self.client.cache();
        cache.update(&QueryKey::Messages(message.conversation_id), |value| {
            let CacheValue::Messages(messages) = value else {
                return None;
            };
            append_message(messages, message).map(CacheValue::Messages)
        });
        cache.update_where(QueryKey::is_conversation_list, |_, value| {
            let CacheValue::Conversations(list) = value else {
                return None;
            };
            apply_message_sent(list, message, message.sender_id).map(CacheValue::Conversations)
        });
    }

    pub async fn upload_attachment(&self, upload: FileUpload) -> Result<FileRef, SyncError> {
        if let Err(err) = validate_upload(&upload) {
            self.surface(&err);
            return Err(err);
        }
        let cancel = CancellationToken::new();
        let remote = self.client.remote().as_ref();
        let (upload_ref, cancel_ref) = (&upload, &cancel);
        let result = retry_with_backoff(
            move || remote.upload_file(upload_ref, cancel_ref),
            &self.upload_policy,
        )
        .await;
        if let Err(err) = &result {
            self.surface(err);
        }
        result
    }

    /// Cancels the send in flight, if any. The cancelled send is still queued
    /// but raises no error toast.
    pub fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.deadline.abort();
    }

    pub fn save_draft(&self, conversation_id: ConversationId, content: &str, files: Vec<FileRef>) {
        self.drafts
            .save(Draft::new(conversation_id, content).with_files(files));
    }

    pub fn draft(&self, conversation_id: ConversationId) -> Option<Draft> {
        self.drafts.get(conversation_id)
    }

    pub fn failed_operations(&self, conversation_id: Option<ConversationId>) -> Vec<FailedOperation> {
        self.failed.get_all(conversation_id)
    }

    fn surface_unless_aborted(&self, err: &SyncError, aborts_before: u64) {
        if self.aborts.load(Ordering::SeqCst) != aborts_before {
            info!(code = ?err.code, "outbox: send cancelled by the user");
            return;
        }
        self.surface(err);
    }

    fn surface(&self, err: &SyncError) {
        self.client.emit(ClientEvent::Error {
            code: err.code,
            message: err.user_message().to_string(),
        });
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
