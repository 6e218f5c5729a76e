#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Deserialize;
use tokio::sync::watch;
use url::Url;

use adoptly_chat::{ChatConfig, ChatService, ConversationSnapshot, ConversationView};
use adoptly_realtime::{ChannelClient, MemoryBroker, ReconnectPolicy};
use adoptly_session::{ApiClient, HttpTokenRefresher, MemoryCredentialStore, SessionCoordinator};
use adoptly_types::models::CredentialPair;

/// Signs an access token for `user` the way the API server would.
pub fn mint(user: &str, version: u32) -> String {
    let claims = serde_json::json!({"_id": user, "v": version, "exp": 4_102_444_800u64});
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"server-secret")).unwrap()
}

#[derive(Default)]
pub struct MockApi {
    pub history: Mutex<HashMap<String, serde_json::Value>>,
    pub metadata: Mutex<HashMap<String, serde_json::Value>>,
    pub reads: Mutex<Vec<(String, String)>>,
    pub requests: AtomicUsize,
    /// Makes `/conversations/{id}/read` answer 500.
    pub reads_fail: AtomicBool,
    /// Access token handed out by `/auth/refresh`; `None` answers 401.
    pub refresh_to: Mutex<Option<String>>,
}

impl MockApi {
    pub fn with_history(&self, conversation_id: &str, messages: serde_json::Value) {
        self.history
            .lock()
            .unwrap()
            .insert(conversation_id.into(), serde_json::json!({"success": true, "data": messages}));
    }

    pub fn with_participants(&self, conversation_id: &str, participants: &[&str]) {
        self.metadata.lock().unwrap().insert(
            conversation_id.into(),
            serde_json::json!({"_id": conversation_id, "participants": participants}),
        );
    }

    pub fn reads_for(&self, conversation_id: &str) -> Vec<String> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == conversation_id)
            .map(|(_, at)| at.clone())
            .collect()
    }
}

#[derive(Deserialize)]
struct ReadBody {
    at: String,
}

async fn history(State(api): State<Arc<MockApi>>, Path(id): Path<String>) -> impl IntoResponse {
    api.requests.fetch_add(1, Ordering::SeqCst);
    match api.history.lock().unwrap().get(&id) {
        Some(body) => (StatusCode::OK, Json(body.clone())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"success": false, "message": "Conversation not found"})),
        ),
    }
}

async fn metadata(State(api): State<Arc<MockApi>>, Path(id): Path<String>) -> impl IntoResponse {
    api.requests.fetch_add(1, Ordering::SeqCst);
    match api.metadata.lock().unwrap().get(&id) {
        Some(body) => (StatusCode::OK, Json(body.clone())),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"message": "Not implemented"}))),
    }
}

async fn mark_read(
    State(api): State<Arc<MockApi>>,
    Path(id): Path<String>,
    Json(body): Json<ReadBody>,
) -> impl IntoResponse {
    api.requests.fetch_add(1, Ordering::SeqCst);
    api.reads.lock().unwrap().push((id, body.at));
    if api.reads_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"message": "db down"})));
    }
    (StatusCode::OK, Json(serde_json::json!({"success": true})))
}

async fn refresh(State(api): State<Arc<MockApi>>) -> impl IntoResponse {
    api.requests.fetch_add(1, Ordering::SeqCst);
    match api.refresh_to.lock().unwrap().clone() {
        Some(token) => (StatusCode::OK, Json(serde_json::json!({"accessToken": token}))),
        None => (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"message": "expired"}))),
    }
}

pub async fn spawn_api(api: Arc<MockApi>) -> Url {
    let app = Router::new()
        .route("/api/conversations/{id}/messages", get(history))
        .route("/api/conversations/{id}", get(metadata))
        .route("/api/conversations/{id}/read", post(mark_read))
        .route("/api/auth/refresh", post(refresh))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/api", addr)).unwrap()
}

/// One signed-in client process: session, API client, channel and chat.
pub struct TestClient {
    pub session: SessionCoordinator,
    pub channel: ChannelClient,
    pub chat: ChatService,
}

pub fn fast_config() -> ChatConfig {
    ChatConfig {
        typing_idle: Duration::from_millis(100),
        peer_typing_ttl: Duration::from_millis(150),
    }
}

pub fn client(base: &Url, broker: &MemoryBroker, pair: Option<CredentialPair>, config: ChatConfig) -> TestClient {
    let http = ApiClient::http_client(Duration::from_secs(5)).unwrap();
    let store = match pair {
        Some(pair) => MemoryCredentialStore::with_pair(pair),
        None => MemoryCredentialStore::new(),
    };
    let refresher = HttpTokenRefresher::new(http.clone(), base).unwrap();
    let session = SessionCoordinator::new(Arc::new(store), Arc::new(refresher));
    let api = ApiClient::new(http, base, session.clone());
    let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 0.0);
    let channel = ChannelClient::new(session.clone(), Arc::new(broker.clone()), policy);
    let chat = ChatService::new(api, channel.clone(), config);
    TestClient {
        session,
        channel,
        chat,
    }
}

/// Signs `user` in with a fresh token the broker accepts.
pub fn signed_in(base: &Url, broker: &MemoryBroker, user: &str) -> TestClient {
    let token = mint(user, 1);
    broker.authorize(token.clone(), user);
    client(base, broker, Some(CredentialPair::new(token, Some(format!("refresh-{}", user)))), fast_config())
}

pub async fn wait_for(
    view: &ConversationView,
    what: &str,
    mut check: impl FnMut(&ConversationSnapshot) -> bool,
) -> ConversationSnapshot {
    let mut rx: watch::Receiver<ConversationSnapshot> = view.watch();
    let result = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| check(s))).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {}: {:?}", what, view.snapshot()),
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {}", what);
}

pub fn texts(snapshot: &ConversationSnapshot) -> Vec<&str> {
    snapshot.messages.iter().map(|m| m.text.as_str()).collect()
}
