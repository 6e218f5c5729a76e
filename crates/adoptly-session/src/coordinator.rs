use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use adoptly_types::api::{RefreshRequest, TokenResponse};
use adoptly_types::models::CredentialPair;

use crate::error::SessionError;
use crate::store::CredentialStore;

/// Timeout for the refresh call itself.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one refresh, shared by every caller that joined it.
pub type RefreshOutcome = Result<CredentialPair, SessionError>;

/// Handle to the refresh that is currently in flight.
pub type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Credential lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new credential was stored (refresh or sign-in).
    Rotated(CredentialPair),
    /// The session was cleared; the user must sign in again.
    SignedOut,
}

/// Exchanges a refresh token for a new credential pair.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, RefreshOutcome>;
}

/// `POST {base}/auth/refresh {refreshToken}`. Bypasses the authenticated
/// client so a failing refresh can never trigger another refresh.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    url: Url,
}

impl HttpTokenRefresher {
    pub fn new(http: reqwest::Client, api_base: &Url) -> Result<Self, url::ParseError> {
        let url = Url::parse(&format!("{}/auth/refresh", api_base.as_str().trim_end_matches('/')))?;
        Ok(Self { http, url })
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, RefreshOutcome> {
        let http = self.http.clone();
        let url = self.url.clone();
        async move {
            let denied = |e: reqwest::Error| SessionError::RefreshDenied(e.to_string());

            let resp = http
                .post(url)
                .timeout(REFRESH_TIMEOUT)
                .json(&RefreshRequest {
                    refresh_token: Some(refresh_token.clone()),
                })
                .send()
                .await
                .map_err(denied)?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SessionError::RefreshDenied(format!("server answered {}", status)));
            }

            let body: TokenResponse = resp.json().await.map_err(denied)?;
            body.credential(Some(refresh_token.as_str())).ok_or_else(|| {
                SessionError::RefreshDenied("no access token in refresh response".into())
            })
        }
        .boxed()
    }
}

/// Owns credential refresh policy for the whole process.
///
/// Cheap to clone; all clones share the store, the in-flight refresh slot and
/// the notification channel.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    /// At most one refresh exists at a time; later callers join it.
    in_flight: Mutex<Option<PendingRefresh>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                refresher,
                in_flight: Mutex::new(None),
                events,
            }),
        }
    }

    /// The credential currently believed valid. It may already be expired;
    /// callers find out from a 401.
    pub fn current(&self) -> Option<CredentialPair> {
        self.inner.store.get().filter(CredentialPair::is_authenticated)
    }

    /// Value for the `Authorization` header, if signed in.
    pub fn authorization_header(&self) -> Option<String> {
        self.current().map(|pair| pair.bearer())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stores a credential obtained outside the refresh flow (sign-in).
    pub fn install(&self, pair: CredentialPair) -> Result<(), SessionError> {
        self.inner.store.set(&pair)?;
        info!("Session credential installed");
        self.inner.notify(SessionEvent::Rotated(pair));
        Ok(())
    }

    /// Clears the session and tells every subscriber.
    pub fn sign_out(&self) -> Result<(), SessionError> {
        let result = self.inner.store.clear();
        info!("Session cleared");
        self.inner.notify(SessionEvent::SignedOut);
        result
    }

    /// Starts a refresh, or joins the one already in flight.
    ///
    /// The refresh runs on its own task: dropping the returned future does not
    /// cancel it, and every caller sees the same outcome.
    pub fn force_refresh(&self) -> PendingRefresh {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(pending) = slot.as_ref() {
            debug!("Joining in-flight credential refresh");
            return pending.clone();
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.run_refresh().await;
            // Clear the slot before waiters resume so a later 401 can start
            // a fresh refresh.
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            outcome
        });

        let pending = async move {
            task.await.unwrap_or_else(|e| {
                Err(SessionError::RefreshDenied(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *slot = Some(pending.clone());
        pending
    }

    /// Session bootstrap: the stored credential, or one non-interactive
    /// refresh attempt. Fails with `Unauthenticated` when neither works.
    pub async fn ensure_credential(&self) -> Result<CredentialPair, SessionError> {
        if let Some(pair) = self.current() {
            return Ok(pair);
        }
        debug!("No usable credential stored, attempting refresh");
        self.force_refresh().await.map_err(|e| {
            info!("Session bootstrap failed: {}", e);
            SessionError::Unauthenticated
        })
    }
}

impl CoordinatorInner {
    async fn run_refresh(&self) -> RefreshOutcome {
        let refresh_token = self
            .store
            .get()
            .and_then(|pair| pair.refresh_token().map(str::to_string));

        let Some(refresh_token) = refresh_token else {
            warn!("Credential refresh requested without a stored refresh token");
            self.demote();
            return Err(SessionError::RefreshDenied("no refresh token stored".into()));
        };

        info!("Refreshing session credential");
        match self.refresher.refresh(refresh_token).await {
            Ok(pair) => {
                self.store.set(&pair)?;
                info!("Session credential rotated");
                self.notify(SessionEvent::Rotated(pair.clone()));
                Ok(pair)
            }
            Err(e) => {
                warn!("Credential refresh failed: {}", e);
                self.demote();
                Err(e)
            }
        }
    }

    fn demote(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear credential store: {}", e);
        }
        self.notify(SessionEvent::SignedOut);
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine: nothing is connected yet.
        let _ = self.events.send(event);
    }
}
