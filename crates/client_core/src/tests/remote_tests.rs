use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::domain::{ConversationKind, MemberRole, MessageId};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    filters: Arc<Mutex<Vec<String>>>,
    authorization: Arc<Mutex<Option<String>>>,
    read_marks: Arc<Mutex<Vec<i64>>>,
    uploads: Arc<Mutex<Vec<(String, usize)>>>,
}

async fn list_conversations(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<ConversationSummary>> {
    state
        .filters
        .lock()
        .await
        .push(params.get("filter").cloned().unwrap_or_default());
    *state.authorization.lock().await = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Json(vec![ConversationSummary {
        conversation_id: ConversationId(5),
        kind: ConversationKind::Direct,
        title: "ops".into(),
        last_message: None,
        unread_count: 2,
        updated_at: Utc::now(),
    }])
}

async fn members_unavailable() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance")
}

async fn remove_forbidden() -> StatusCode {
    StatusCode::FORBIDDEN
}

async fn mark_read(State(state): State<ServerState>, Path(id): Path<i64>) -> StatusCode {
    state.read_marks.lock().await.push(id);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct AddMemberBody {
    user_id: i64,
}

async fn add_member(Json(body): Json<AddMemberBody>) -> Json<GroupMember> {
    Json(GroupMember {
        user_id: UserId(body.user_id),
        display_name: format!("user {}", body.user_id),
        role: MemberRole::Member,
    })
}

async fn send_message(
    Path(id): Path<i64>,
    Json(body): Json<OutgoingMessage>,
) -> Json<ChatMessage> {
    Json(ChatMessage {
        message_id: MessageId(77),
        conversation_id: ConversationId(id),
        sender_id: UserId(1),
        sender_name: Some("me".into()),
        content: body.content,
        attachments: body.attachments,
        sent_at: Utc::now(),
    })
}

async fn slow_messages() -> Json<Vec<ChatMessage>> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(Vec::new())
}

async fn upload(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Json<FileRef> {
    let filename = params.get("filename").cloned().unwrap_or_default();
    state.uploads.lock().await.push((filename.clone(), body.len()));
    Json(FileRef {
        file_id: shared::domain::FileId(3),
        filename,
        size_bytes: body.len() as u64,
        mime_type: params.get("mime_type").cloned(),
    })
}

async fn spawn_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:id/members",
            get(members_unavailable).post(add_member),
        )
        .route("/conversations/:id/members/:user", delete(remove_forbidden))
        .route("/conversations/:id/read", post(mark_read))
        .route(
            "/conversations/:id/messages",
            get(slow_messages).post(send_message),
        )
        .route("/files", post(upload))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn lists_conversations_with_filter_and_bearer_token() {
    let (url, state) = spawn_server().await;
    let api = HttpRemoteApi::new(&url, Connectivity::new())
        .expect("api")
        .with_bearer_token("secret");

    let list = api
        .list_conversations(ConversationFilter::Unread, &CancellationToken::new())
        .await
        .expect("list");

    assert_eq!(list.len(), 1);
    assert_eq!(list[0].unread_count, 2);
    assert_eq!(*state.filters.lock().await, vec!["unread".to_string()]);
    assert_eq!(
        state.authorization.lock().await.as_deref(),
        Some("Bearer secret")
    );
}

#[tokio::test]
async fn server_errors_map_to_retryable_code() {
    let (url, _state) = spawn_server().await;
    let api = HttpRemoteApi::new(&url, Connectivity::new()).expect("api");

    let err = api
        .list_group_members(ConversationId(5), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ServerError);
    assert_eq!(err.status, Some(503));
    assert_eq!(err.message, "maintenance");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn forbidden_maps_to_unauthorized() {
    let (url, _state) = spawn_server().await;
    let api = HttpRemoteApi::new(&url, Connectivity::new()).expect("api");

    let err = api
        .remove_group_member(ConversationId(5), UserId(9), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn write_calls_reach_their_endpoints() {
    let (url, state) = spawn_server().await;
    let api = HttpRemoteApi::new(&url, Connectivity::new()).expect("api");
    let cancel = CancellationToken::new();

    api.mark_conversation_read(ConversationId(8), &cancel)
        .await
        .expect("mark read");
    let added = api
        .add_group_member(ConversationId(8), UserId(12), &cancel)
        .await
        .expect("add member");
    let sent = api
        .send_message(
            &OutgoingMessage {
                conversation_id: ConversationId(8),
                content: "hello".into(),
                attachments: Vec::new(),
            },
            &cancel,
        )
        .await
        .expect("send");
    let file = api
        .upload_file(
            &FileUpload {
                conversation_id: ConversationId(8),
                filename: "notes.txt".into(),
                mime_type: "text/plain".into(),
                bytes: b"abc".to_vec(),
            },
            &cancel,
        )
        .await
        .expect("upload");

    assert_eq!(*state.read_marks.lock().await, vec![8]);
    assert_eq!(added.user_id, UserId(12));
    assert_eq!(sent.conversation_id, ConversationId(8));
    assert_eq!(sent.content, "hello");
    assert_eq!(file.size_bytes, 3);
    assert_eq!(file.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(
        *state.uploads.lock().await,
        vec![("notes.txt".to_string(), 3)]
    );
}

#[tokio::test]
async fn cancellation_aborts_request_in_flight() {
    let (url, _state) = spawn_server().await;
    let api = HttpRemoteApi::new(&url, Connectivity::new()).expect("api");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = api
        .list_messages(ConversationId(5), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, SyncError::aborted());
    assert_eq!(err.code, ErrorCode::NetworkTimeout);
}

#[tokio::test]
async fn offline_fails_fast_without_request() {
    let (url, state) = spawn_server().await;
    let connectivity = Connectivity::new();
    let api = HttpRemoteApi::new(&url, connectivity.clone()).expect("api");
    connectivity.set_online(false);

    let err = api
        .list_conversations(ConversationFilter::All, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::NetworkOffline);
    assert!(state.filters.lock().await.is_empty());
}

#[tokio::test]
async fn refused_connection_is_classified_offline() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let api = HttpRemoteApi::new(&format!("http://{addr}"), Connectivity::new()).expect("api");
    let err = api
        .list_conversations(ConversationFilter::All, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::NetworkOffline);
}

#[test]
fn rejects_invalid_server_urls() {
    assert!(HttpRemoteApi::new("not a url", Connectivity::new()).is_err());
    let err = HttpRemoteApi::new("ftp://example.com", Connectivity::new())
        .err()
        .expect("scheme rejected");
    assert_eq!(err.code, ErrorCode::BadRequest);
}
