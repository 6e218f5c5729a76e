/// Integration test: the authenticated client against a local mock API.
///
/// The mock accepts only the bearer token it issued last, so a stale token
/// forces the 401 -> refresh -> replay path.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use url::Url;

use adoptly_session::{
    ApiClient, ApiRequest, AuthApi, HttpTokenRefresher, MemoryCredentialStore, SessionCoordinator,
    SessionError,
};
use adoptly_types::models::CredentialPair;

#[derive(Default)]
struct MockApi {
    valid_token: Mutex<String>,
    refresh_calls: AtomicUsize,
    refresh_denied: bool,
    protected_calls: AtomicUsize,
    login_calls: AtomicUsize,
}

fn authorized(state: &MockApi, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.valid_token.lock().unwrap());
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn refresh(State(state): State<Arc<MockApi>>) -> impl IntoResponse {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    // Long enough for every concurrent 401 to land while this is pending.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if state.refresh_denied {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"message": "expired"})));
    }
    let token = format!("fresh-{}", n);
    *state.valid_token.lock().unwrap() = token.clone();
    (
        StatusCode::OK,
        Json(serde_json::json!({"tokens": {"accessToken": token, "refreshToken": "r2"}})),
    )
}

async fn messages(State(state): State<Arc<MockApi>>, headers: HeaderMap) -> impl IntoResponse {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"message": "jwt expired"})));
    }
    (StatusCode::OK, Json(serde_json::json!({"success": true, "data": []})))
}

async fn always_unauthorized(State(state): State<Arc<MockApi>>) -> impl IntoResponse {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED
}

async fn login(State(state): State<Arc<MockApi>>) -> impl IntoResponse {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED
}

async fn spawn_api(state: Arc<MockApi>) -> Url {
    let app = Router::new()
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/login", post(login))
        .route("/api/conversations/c1/messages", get(messages))
        .route("/api/locked", get(always_unauthorized))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/api/", addr)).unwrap()
}

fn client(base: &Url, pair: CredentialPair) -> ApiClient {
    let http = ApiClient::http_client(Duration::from_secs(5)).unwrap();
    let refresher = HttpTokenRefresher::new(http.clone(), base).unwrap();
    let session = SessionCoordinator::new(
        Arc::new(MemoryCredentialStore::with_pair(pair)),
        Arc::new(refresher),
    );
    ApiClient::new(http, base, session)
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh_and_all_succeed() {
    let state = Arc::new(MockApi {
        valid_token: Mutex::new("issued-later".into()),
        ..Default::default()
    });
    let base = spawn_api(state.clone()).await;
    let api = client(&base, CredentialPair::new("stale", Some("r1".into())));

    let calls = (0..10).map(|_| api.send(ApiRequest::get("conversations/c1/messages")));
    let results = futures_util::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    // Ten rejected attempts plus ten replays.
    assert_eq!(state.protected_calls.load(Ordering::SeqCst), 20);

    let pair = api.session().current().unwrap();
    assert_eq!(pair.access_token, "fresh-1");
    assert_eq!(pair.refresh_token.as_deref(), Some("r2"));
}

#[tokio::test]
async fn persistent_401_is_replayed_once_then_surfaces() {
    let state = Arc::new(MockApi::default());
    let base = spawn_api(state.clone()).await;
    let api = client(&base, CredentialPair::new("stale", Some("r1".into())));

    let err = api.send(ApiRequest::get("/locked")).await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.protected_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn denied_refresh_propagates_original_401_and_signs_out() {
    let state = Arc::new(MockApi {
        refresh_denied: true,
        ..Default::default()
    });
    let base = spawn_api(state.clone()).await;
    let api = client(&base, CredentialPair::new("stale", Some("r1".into())));
    let mut events = api.session().subscribe();

    let err = api
        .send(ApiRequest::get("/conversations/c1/messages"))
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(state.protected_calls.load(Ordering::SeqCst), 1);
    assert!(api.session().current().is_none());
    assert_eq!(
        events.recv().await.unwrap(),
        adoptly_session::SessionEvent::SignedOut
    );
    assert_eq!(
        api.session().ensure_credential().await,
        Err(SessionError::Unauthenticated)
    );
}

#[tokio::test]
async fn auth_endpoints_are_never_retried() {
    let state = Arc::new(MockApi::default());
    let base = spawn_api(state.clone()).await;
    let api = client(&base, CredentialPair::new("stale", Some("r1".into())));
    let auth = AuthApi::new(api.clone());

    let err = auth.login("someone@example.com", "wrong").await.unwrap_err();

    assert!(matches!(err, adoptly_session::AuthError::Api(ref e) if e.is_unauthorized()));
    assert_eq!(state.login_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(api.session().current().unwrap().access_token, "stale");
}
