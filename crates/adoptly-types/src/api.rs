use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::CredentialPair;

// -- Token claims --

/// Claims read from the access token to identify the current user.
/// Only identity fields are used; the token is opaque otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl Claims {
    pub fn user_id(&self) -> Option<&str> {
        self.object_id
            .as_deref()
            .or(self.id.as_deref())
            .or(self.sub.as_deref())
            .filter(|id| !id.is_empty())
    }
}

// -- Auth --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Token-bearing response of login, register and refresh. The backend has
/// shipped several shapes over time; all of them are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub tokens: Option<TokenBundle>,
    pub user: Option<SessionUser>,
}

impl TokenResponse {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .or(self.token.as_deref())
            .or(self.tokens.as_ref().and_then(|t| t.access_token.as_deref()))
            .filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .or(self.tokens.as_ref().and_then(|t| t.refresh_token.as_deref()))
            .filter(|t| !t.is_empty())
    }

    /// Builds the new pair, keeping `previous_refresh` when the server did not
    /// rotate the refresh token.
    pub fn credential(&self, previous_refresh: Option<&str>) -> Option<CredentialPair> {
        let access = self.access_token()?;
        let refresh = self.refresh_token().or(previous_refresh).map(str::to_string);
        Some(CredentialPair::new(access, refresh))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LoginRequest {
    Email { email: String, password: String },
    Username { username: String, password: String },
}

impl LoginRequest {
    /// An identifier containing `@` is treated as an e-mail address.
    pub fn from_identifier(identifier: &str, password: &str) -> Self {
        let identifier = identifier.trim();
        if identifier.contains('@') {
            Self::Email {
                email: identifier.to_lowercase(),
                password: password.to_string(),
            }
        } else {
            Self::Username {
                username: identifier.to_string(),
                password: password.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub fullname: String,
    pub username: String,
    pub email: String,
    pub contact_phone: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct MarkReadRequest {
    pub at: DateTime<Utc>,
}

/// Response body that is either the bare payload or the `{success, data}`
/// envelope used by most endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiPayload<T> {
    Envelope {
        success: bool,
        #[serde(alias = "user")]
        data: Option<T>,
    },
    Bare(T),
}

impl<T> ApiPayload<T> {
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Envelope { success, .. } => *success,
            Self::Bare(_) => true,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Envelope { data, .. } => data,
            Self::Bare(data) => Some(data),
        }
    }
}
