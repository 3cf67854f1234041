//! HTTP client for the video platform REST API.

use super::{NewVideoUser, OAuthClient, VideoApiError, VideoPlatformClient, VideoUser};
use crate::credentials::TokenPair;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Page size for admin user searches.
const SEARCH_PAGE_SIZE: u32 = 100;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

impl TryFrom<TokenResponse> for TokenPair {
    type Error = VideoApiError;

    fn try_from(response: TokenResponse) -> Result<Self, Self::Error> {
        let expires_at = match response.expires_in {
            Some(seconds) => Some(
                Duration::try_seconds(seconds)
                    .filter(|ttl| *ttl >= Duration::zero())
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                    .ok_or_else(|| {
                        VideoApiError::Malformed(format!(
                            "token response: expires_in {} out of range",
                            seconds
                        ))
                    })?,
            ),
            None => None,
        };
        Ok(TokenPair {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
        })
    }
}

#[derive(Deserialize)]
struct UserList {
    data: Vec<VideoUser>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserBody<'a> {
    username: &'a str,
    password: &'a str,
    email: &'a str,
    role: i32,
    video_quota: i64,
    video_quota_daily: i64,
}

#[derive(Deserialize)]
struct CreatedUser {
    user: CreatedUserId,
}

#[derive(Deserialize)]
struct CreatedUserId {
    id: i64,
}

/// REST client for the video platform.
///
/// Every request is bounded by the client timeout so a slow platform cannot
/// stall an authentication request. The base URL can be swapped at runtime
/// when the settings screen changes it.
pub struct HttpVideoPlatform {
    http_client: Client,
    base_url: RwLock<Option<String>>,
}

impl HttpVideoPlatform {
    /// Creates a client with the given per-request timeout.
    pub fn new(base_url: Option<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .user_agent("identity-bridge/0.1")
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http_client,
            base_url: RwLock::new(base_url.map(|url| url.trim_end_matches('/').to_string())),
        })
    }

    /// Points the client at a new base URL.
    pub fn set_base_url(&self, base_url: Option<String>) {
        if let Ok(mut current) = self.base_url.write() {
            *current = base_url.map(|url| url.trim_end_matches('/').to_string());
        }
    }

    fn url(&self, path: &str) -> Result<String, VideoApiError> {
        let base = self
            .base_url
            .read()
            .map_err(|_| VideoApiError::Unavailable("base URL lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| VideoApiError::NotConfigured("base URL not set".to_string()))?;
        Ok(format!("{}{}", base, path))
    }

    async fn token_request(&self, form: HashMap<&str, &str>) -> Result<TokenPair, VideoApiError> {
        let url = self.url("/api/v1/users/token")?;
        tracing::debug!(
            grant_type = form.get("grant_type").copied().unwrap_or_default(),
            "Requesting video platform token"
        );

        let response = self
            .http_client
            .post(&url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| VideoApiError::Malformed(format!("token response: {}", e)))?;
        TokenPair::try_from(token)
    }
}

fn transport_error(err: reqwest::Error) -> VideoApiError {
    if err.is_timeout() {
        VideoApiError::Unavailable(format!("request timed out: {}", err))
    } else {
        VideoApiError::Unavailable(err.to_string())
    }
}

/// Maps non-success statuses to [`VideoApiError::Rejected`].
async fn check_status(response: Response) -> Result<Response, VideoApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(VideoApiError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl VideoPlatformClient for HttpVideoPlatform {
    async fn discover_client(&self) -> Result<OAuthClient, VideoApiError> {
        let url = self.url("/api/v1/oauth-clients/local")?;
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<OAuthClient>()
            .await
            .map_err(|e| VideoApiError::Malformed(format!("oauth client: {}", e)))
    }

    async fn password_grant(
        &self,
        client: &OAuthClient,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, VideoApiError> {
        let mut form = HashMap::new();
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());
        form.insert("grant_type", "password");
        form.insert("username", username);
        form.insert("password", password);
        self.token_request(form).await
    }

    async fn refresh_grant(
        &self,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<TokenPair, VideoApiError> {
        let mut form = HashMap::new();
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        self.token_request(form).await
    }

    async fn get_user(&self, admin_token: &str, id: i64) -> Result<Option<VideoUser>, VideoApiError> {
        let url = self.url(&format!("/api/v1/users/{}", id))?;
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(admin_token)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        response
            .json::<VideoUser>()
            .await
            .map(Some)
            .map_err(|e| VideoApiError::Malformed(format!("user {}: {}", id, e)))
    }

    async fn search_users(
        &self,
        admin_token: &str,
        query: &str,
    ) -> Result<Vec<VideoUser>, VideoApiError> {
        let url = self.url("/api/v1/users")?;
        let count = SEARCH_PAGE_SIZE.to_string();
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(admin_token)
            .query(&[("search", query), ("count", count.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<UserList>()
            .await
            .map(|list| list.data)
            .map_err(|e| VideoApiError::Malformed(format!("user search: {}", e)))
    }

    async fn create_user(&self, admin_token: &str, user: &NewVideoUser) -> Result<i64, VideoApiError> {
        let url = self.url("/api/v1/users")?;
        let body = CreateUserBody {
            username: &user.username,
            password: &user.password,
            email: &user.email,
            role: user.role,
            video_quota: user.video_quota,
            video_quota_daily: -1,
        };
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(admin_token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<CreatedUser>()
            .await
            .map(|created| created.user.id)
            .map_err(|e| VideoApiError::Malformed(format!("created user: {}", e)))
    }

    async fn set_password(
        &self,
        admin_token: &str,
        id: i64,
        password: &str,
    ) -> Result<(), VideoApiError> {
        let url = self.url(&format!("/api/v1/users/{}", id))?;
        let response = self
            .http_client
            .put(&url)
            .bearer_auth(admin_token)
            .json(&serde_json::json!({ "password": password }))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(VideoApiError::NotFound(format!("user {}", id)));
        }
        check_status(response).await?;
        Ok(())
    }
}
