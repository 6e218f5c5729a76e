use std::time::Duration;

use reqwest::{Method, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::Url;

use crate::coordinator::SessionCoordinator;
use crate::error::ApiError;

/// Default timeout for API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Paths that are part of the authentication flow itself. A 401 from one of
/// these is final; retrying would loop on refresh.
const AUTH_ENDPOINTS: &[&str] = &[
    "/auth/login",
    "/auth/register",
    "/auth/refresh",
    "/auth/logout",
    "/password/forgot",
    "/password/reset",
];

pub fn is_auth_endpoint(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default().to_lowercase();
    let path = path.trim_end_matches('/');
    AUTH_ENDPOINTS.iter().any(|suffix| path.ends_with(suffix))
}

/// One outbound API call. A request that has been replayed after a refresh is
/// marked and never replayed again.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_retry(&self) -> bool {
        self.retried
    }

    fn into_retry(mut self) -> Self {
        self.retried = true;
        self
    }
}

/// Status and body of a completed call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    fn into_result(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::Status {
                status: self.status,
                body: self.body,
            })
        }
    }
}

/// HTTP client that attaches the session's bearer credential and recovers
/// from one 401 per request through a shared refresh.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: SessionCoordinator,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: &Url, session: SessionCoordinator) -> Self {
        Self {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            session,
        }
    }

    /// Builds the underlying `reqwest::Client` with the default timeout.
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ApiError> {
        Ok(reqwest::Client::builder().timeout(timeout).build()?)
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.dispatch(&request).await?;

        if response.status != StatusCode::UNAUTHORIZED
            || request.is_retry()
            || is_auth_endpoint(request.path())
        {
            return response.into_result();
        }

        debug!("401 on {} {}, refreshing credential", request.method, request.path);
        match self.session.force_refresh().await {
            Ok(_) => {
                let retry = request.into_retry();
                self.dispatch(&retry).await?.into_result()
            }
            Err(e) => {
                warn!("Refresh after 401 failed: {}", e);
                response.into_result()
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        let lower = path.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Url::parse(path)?);
        }
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{}/{}", self.base_url, path))?)
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(&request.path)?;
        let mut builder = self.http.request(request.method.clone(), url);

        if let Some(bearer) = self.session.authorization_header() {
            builder = builder.header(header::AUTHORIZATION, bearer);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        trace!("{} {} -> {}", request.method, request.path, status);

        Ok(ApiResponse { status, body })
    }
}
