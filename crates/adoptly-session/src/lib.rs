//! Credential lifecycle for the Adoptly client: storage, single-flight
//! refresh, and an HTTP client that recovers from expired access tokens.

pub mod auth;
pub mod claims;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod store;

pub use auth::AuthApi;
pub use client::{ApiClient, ApiRequest, ApiResponse};
pub use coordinator::{HttpTokenRefresher, SessionCoordinator, SessionEvent, TokenRefresher};
pub use error::{ApiError, AuthError, SessionError};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
