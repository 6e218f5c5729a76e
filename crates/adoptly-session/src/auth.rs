use tracing::{debug, info, warn};

use adoptly_types::api::{
    ApiPayload, ForgotPasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest,
    SessionUser, SuccessResponse, TokenResponse,
};

use crate::client::{ApiClient, ApiRequest};
use crate::error::{AuthError, SessionError};

/// Sign-in, sign-up and account recovery on top of the authenticated client.
#[derive(Clone)]
pub struct AuthApi {
    api: ApiClient,
}

impl AuthApi {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Signs in with an e-mail address or a username and installs the
    /// returned credential.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<SessionUser, AuthError> {
        let request = LoginRequest::from_identifier(identifier, password);
        let body: TokenResponse = self.api.post_json("/auth/login", &request).await?.json()?;
        self.establish(body).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<SessionUser, AuthError> {
        let body: TokenResponse = self.api.post_json("/auth/register", request).await?.json()?;
        self.establish(body).await
    }

    /// Tells the server to revoke the session, then clears it locally whatever
    /// the server said.
    pub async fn logout(&self) -> Result<(), AuthError> {
        if self.api.session().current().is_some() {
            if let Err(e) = self.api.send(ApiRequest::post("/auth/logout")).await {
                debug!("Server logout failed, clearing locally anyway: {}", e);
            }
        }
        self.api.session().sign_out()?;
        Ok(())
    }

    pub async fn forgot_password(&self, email: &str) -> Result<bool, AuthError> {
        let request = ForgotPasswordRequest {
            email: email.trim().to_lowercase(),
        };
        let body: SuccessResponse = self
            .api
            .post_json("/auth/password/forgot", &request)
            .await?
            .json()?;
        Ok(body.success)
    }

    pub async fn reset_password(&self, token: &str, password: &str) -> Result<bool, AuthError> {
        let request = ResetPasswordRequest {
            token: token.to_string(),
            password: password.to_string(),
        };
        let body: SuccessResponse = self
            .api
            .post_json("/auth/password/reset", &request)
            .await?
            .json()?;
        Ok(body.success)
    }

    /// Restores the signed-in user from `/users/me`. `None` when there is no
    /// stored credential; a failure clears the session.
    pub async fn load_me(&self) -> Result<Option<SessionUser>, AuthError> {
        if self.api.session().current().is_none() {
            return Ok(None);
        }

        let result = self
            .api
            .get_json::<ApiPayload<SessionUser>>("/users/me")
            .await
            .map_err(AuthError::from)
            .and_then(|payload| {
                if !payload.succeeded() {
                    return Err(AuthError::Session(SessionError::Unauthenticated));
                }
                payload
                    .into_data()
                    .ok_or(AuthError::Session(SessionError::Unauthenticated))
            });

        match result {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!("Could not restore session user: {}", e);
                if let Err(clear) = self.api.session().sign_out() {
                    warn!("Failed to clear session: {}", clear);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, body: TokenResponse) -> Result<SessionUser, AuthError> {
        let pair = body.credential(None).ok_or(AuthError::MissingToken)?;
        self.api.session().install(pair)?;

        let user = match body.user {
            Some(user) => user,
            None => self
                .load_me()
                .await?
                .ok_or(AuthError::Session(SessionError::Unauthenticated))?,
        };
        info!("Signed in as {}", user.username.as_deref().unwrap_or(&user.id));
        Ok(user)
    }
}
