//! Stand-in client used when the video platform is not configured.

use super::{NewVideoUser, OAuthClient, VideoApiError, VideoPlatformClient, VideoUser};
use crate::credentials::TokenPair;
use async_trait::async_trait;

/// Every call fails with [`VideoApiError::NotConfigured`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVideoPlatform;

fn not_configured<T>() -> Result<T, VideoApiError> {
    Err(VideoApiError::NotConfigured(
        "video platform integration disabled".to_string(),
    ))
}

#[async_trait]
impl VideoPlatformClient for NullVideoPlatform {
    async fn discover_client(&self) -> Result<OAuthClient, VideoApiError> {
        not_configured()
    }

    async fn password_grant(
        &self,
        _client: &OAuthClient,
        _username: &str,
        _password: &str,
    ) -> Result<TokenPair, VideoApiError> {
        not_configured()
    }

    async fn refresh_grant(
        &self,
        _client: &OAuthClient,
        _refresh_token: &str,
    ) -> Result<TokenPair, VideoApiError> {
        not_configured()
    }

    async fn get_user(&self, _admin_token: &str, _id: i64) -> Result<Option<VideoUser>, VideoApiError> {
        not_configured()
    }

    async fn search_users(
        &self,
        _admin_token: &str,
        _query: &str,
    ) -> Result<Vec<VideoUser>, VideoApiError> {
        not_configured()
    }

    async fn create_user(
        &self,
        _admin_token: &str,
        _user: &NewVideoUser,
    ) -> Result<i64, VideoApiError> {
        not_configured()
    }

    async fn set_password(
        &self,
        _admin_token: &str,
        _id: i64,
        _password: &str,
    ) -> Result<(), VideoApiError> {
        not_configured()
    }
}
