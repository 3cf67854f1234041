//! Video platform API seam.
//!
//! Everything the lifecycle engines need from the video platform goes through
//! [`VideoPlatformClient`]: the OAuth token endpoint, OAuth client discovery,
//! and the admin user endpoints used by repair.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::credentials::TokenPair;

mod http;
mod null;

pub use http::HttpVideoPlatform;
pub use null::NullVideoPlatform;

/// Failures reported by a [`VideoPlatformClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VideoApiError {
    /// Connect error, timeout, or unreadable response
    #[error("video platform unavailable: {0}")]
    Unavailable(String),

    /// Non-success status returned by the platform
    #[error("video platform rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("video platform not configured: {0}")]
    NotConfigured(String),
}

/// OAuth client credentials registered on the video platform.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Account as reported by the admin user endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub blocked: bool,
}

/// Account creation request used by repair.
#[derive(Clone, PartialEq, Eq)]
pub struct NewVideoUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: i32,
    pub video_quota: i64,
}

impl fmt::Debug for NewVideoUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewVideoUser")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .field("video_quota", &self.video_quota)
            .finish()
    }
}

/// Video platform operations used by the credential lifecycle.
///
/// Admin operations take the service-wide admin bearer token.
#[async_trait]
pub trait VideoPlatformClient: Send + Sync {
    /// Fetches the platform's local OAuth client credentials.
    async fn discover_client(&self) -> Result<OAuthClient, VideoApiError>;

    /// `grant_type=password`
    async fn password_grant(
        &self,
        client: &OAuthClient,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, VideoApiError>;

    /// `grant_type=refresh_token`
    async fn refresh_grant(
        &self,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<TokenPair, VideoApiError>;

    /// Returns `None` when the account does not exist.
    async fn get_user(&self, admin_token: &str, id: i64) -> Result<Option<VideoUser>, VideoApiError>;

    /// Substring search over usernames and emails.
    async fn search_users(&self, admin_token: &str, query: &str)
        -> Result<Vec<VideoUser>, VideoApiError>;

    /// Returns the id of the created account.
    async fn create_user(&self, admin_token: &str, user: &NewVideoUser) -> Result<i64, VideoApiError>;

    async fn set_password(
        &self,
        admin_token: &str,
        id: i64,
        password: &str,
    ) -> Result<(), VideoApiError>;
}
