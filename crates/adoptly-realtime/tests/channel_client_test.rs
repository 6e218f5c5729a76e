/// Integration test: the channel client driven against the in-memory broker.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use adoptly_realtime::{
    AuthPayload, ChannelClient, ChannelEvent, ConnectionState, MemoryBroker, RealtimeError,
    ReconnectPolicy, Transport,
};
use adoptly_session::coordinator::RefreshOutcome;
use adoptly_session::{MemoryCredentialStore, SessionCoordinator, SessionError, TokenRefresher};
use adoptly_types::events::{ClientCommand, ServerEvent};
use adoptly_types::models::{CredentialPair, Message};

struct OfflineRefresher;

impl TokenRefresher for OfflineRefresher {
    fn refresh(&self, _refresh_token: String) -> BoxFuture<'static, RefreshOutcome> {
        async { Err(SessionError::RefreshDenied("offline".into())) }.boxed()
    }
}

/// Hands out the token the broker accepts.
struct RotatingRefresher {
    calls: AtomicUsize,
}

impl TokenRefresher for RotatingRefresher {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, RefreshOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(CredentialPair::new("tok-a", Some(refresh_token))) }.boxed()
    }
}

fn session(token: Option<&str>) -> SessionCoordinator {
    let store = match token {
        Some(token) => MemoryCredentialStore::with_pair(CredentialPair::new(token, None)),
        None => MemoryCredentialStore::new(),
    };
    SessionCoordinator::new(Arc::new(store), Arc::new(OfflineRefresher))
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 0.0)
}

fn setup(token: Option<&str>) -> (MemoryBroker, SessionCoordinator, ChannelClient) {
    let broker = MemoryBroker::new();
    broker.authorize("tok-a", "alice");
    let session = session(token);
    let client = ChannelClient::new(session.clone(), Arc::new(broker.clone()), fast_policy());
    (broker, session, client)
}

async fn wait_state(client: &ChannelClient, want: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want))
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn next_event(
    rx: &mut broadcast::Receiver<ChannelEvent>,
    mut want: impl FnMut(&ChannelEvent) -> bool,
) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

fn members(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn message(conversation_id: &str, text: &str) -> ServerEvent {
    ServerEvent::Message(Message {
        id: format!("{}-{}", conversation_id, text),
        conversation_id: conversation_id.into(),
        sender_id: "bob".into(),
        recipient_id: Some("alice".into()),
        text: text.into(),
        created_at: Utc::now(),
    })
}

#[tokio::test]
async fn connect_without_credential_stays_disconnected() {
    let (broker, _session, client) = setup(None);

    client.connect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test]
async fn joins_made_offline_are_replayed_once_on_connect() {
    let (broker, _session, client) = setup(Some("tok-a"));
    let mut events = client.subscribe();

    client.join("c1");
    client.join("c1");
    client.connect();

    next_event(&mut events, |e| *e == ChannelEvent::Connected).await;
    eventually(|| broker.members("c1") == members(&["alice"])).await;

    let joins = broker
        .commands()
        .into_iter()
        .filter(|(_, c)| matches!(c, ClientCommand::Join { .. }))
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn rotation_reconnects_with_new_token_and_rejoins() {
    let (broker, session, client) = setup(Some("tok-a"));
    let mut events = client.subscribe();

    client.join("c1");
    client.join("c2");
    client.connect();
    wait_state(&client, ConnectionState::Connected).await;

    // Only the rotated token is accepted from here on.
    broker.revoke("tok-a");
    broker.authorize("tok-b", "alice");
    session
        .install(CredentialPair::new("tok-b", Some("r".into())))
        .unwrap();

    next_event(&mut events, |e| matches!(e, ChannelEvent::Disconnected { .. })).await;
    next_event(&mut events, |e| *e == ChannelEvent::Reconnected).await;

    assert_eq!(broker.connect_count(), 2);
    eventually(|| {
        broker.members("c1") == members(&["alice"])
            && broker.members("c2") == members(&["alice"])
            && broker.live_links() == 1
    })
    .await;
}

#[tokio::test]
async fn messages_for_unjoined_conversations_are_discarded() {
    let (broker, _session, client) = setup(Some("tok-a"));
    let mut events = client.subscribe();

    client.join("c1");
    client.connect();
    next_event(&mut events, |e| *e == ChannelEvent::Connected).await;

    broker.deliver_to_all(message("c2", "elsewhere"));
    broker.deliver_to_all(message("c1", "here"));

    let ChannelEvent::Message(got) =
        next_event(&mut events, |e| matches!(e, ChannelEvent::Message(_))).await
    else {
        unreachable!()
    };
    assert_eq!(got.text, "here");
}

#[tokio::test]
async fn send_while_disconnected_is_rejected() {
    let (_broker, _session, client) = setup(Some("tok-a"));

    let result = client.send(ClientCommand::Typing {
        conversation_id: "c1".into(),
        is_typing: true,
    });

    assert_eq!(result, Err(RealtimeError::Disconnected));
}

#[tokio::test]
async fn sign_out_disconnects() {
    let (broker, session, client) = setup(Some("tok-a"));

    client.connect();
    wait_state(&client, ConnectionState::Connected).await;

    session.sign_out().unwrap();

    wait_state(&client, ConnectionState::Disconnected).await;
    eventually(|| broker.live_links() == 0).await;
    assert!(client.send(ClientCommand::Leave { conversation_id: "c1".into() }).is_err());
}

#[tokio::test]
async fn dropped_link_reconnects_and_rejoins() {
    let (broker, _session, client) = setup(Some("tok-a"));
    let mut events = client.subscribe();

    client.join("c1");
    client.connect();
    next_event(&mut events, |e| *e == ChannelEvent::Connected).await;

    broker.drop_all();

    next_event(&mut events, |e| matches!(e, ChannelEvent::Disconnected { .. })).await;
    next_event(&mut events, |e| *e == ChannelEvent::Reconnected).await;
    eventually(|| broker.members("c1") == members(&["alice"])).await;
}

#[tokio::test]
async fn refused_connects_are_retried_with_backoff() {
    let (broker, _session, client) = setup(Some("tok-a"));
    broker.refuse_next_connects(2);

    client.connect();
    wait_state(&client, ConnectionState::Connected).await;

    assert_eq!(broker.connect_count(), 3);
}

#[tokio::test]
async fn disconnect_stops_reconnecting() {
    let (broker, _session, client) = setup(Some("tok-a"));

    client.connect();
    wait_state(&client, ConnectionState::Connected).await;

    client.disconnect();
    client.disconnect();
    wait_state(&client, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.connect_count(), 1);
    eventually(|| broker.live_links() == 0).await;
}

#[tokio::test]
async fn rejected_token_is_refreshed_before_retrying() {
    let broker = MemoryBroker::new();
    broker.authorize("tok-a", "alice");
    let refresher = Arc::new(RotatingRefresher {
        calls: AtomicUsize::new(0),
    });
    let store = MemoryCredentialStore::with_pair(CredentialPair::new("tok-stale", Some("r1".into())));
    let session = SessionCoordinator::new(Arc::new(store), refresher.clone());
    let client = ChannelClient::new(session.clone(), Arc::new(broker.clone()), fast_policy());

    client.join("c1");
    client.connect();
    wait_state(&client, ConnectionState::Connected).await;

    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.current().unwrap().access_token, "tok-a");
    eventually(|| broker.members("c1") == members(&["alice"])).await;
}

fn signed_token(user: &str, version: u32) -> String {
    let claims = serde_json::json!({"_id": user, "v": version, "exp": 4_102_444_800u64});
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"test"),
    )
    .unwrap()
}

#[tokio::test]
async fn claim_trusting_broker_accepts_rotated_tokens() {
    let broker = MemoryBroker::new();
    broker.trust_token_claims();
    let first = signed_token("alice", 1);
    let session = session(Some(&first));
    let client = ChannelClient::new(session.clone(), Arc::new(broker.clone()), fast_policy());
    let mut events = client.subscribe();

    client.connect();
    next_event(&mut events, |e| *e == ChannelEvent::Connected).await;

    session
        .install(CredentialPair::new(signed_token("alice", 2), None))
        .unwrap();

    next_event(&mut events, |e| *e == ChannelEvent::Reconnected).await;
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn claim_trusting_broker_still_rejects_opaque_tokens() {
    let broker = MemoryBroker::new();
    broker.trust_token_claims();

    let err = broker
        .connect(AuthPayload {
            token: "not-a-jwt".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::Rejected(_)));
}
