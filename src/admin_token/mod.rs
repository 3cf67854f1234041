//! Service-wide admin token for the video platform.
//!
//! Repair needs admin rights on the video platform (user search, creation,
//! password reset). The admin token lives in the persisted
//! [`ServiceConfig`](crate::services::ServiceConfig), so every bridge process
//! sees the same token, and refreshes are serialized across processes with a
//! lease row in the same database.
//!
//! ```text
//!   access_token() ──valid──────────────────────────▶ stored token
//!        │
//!        └─near expiry / missing─▶ lease ─▶ refresh grant ─▶ store
//!                                    │          └─rejected─▶ password grant
//!                                    └─held elsewhere─▶ stored token (if unexpired)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AdminTokenConfig;
use crate::credentials::TokenPair;
use crate::error::BridgeError;
use crate::lifecycle::DEFAULT_TOKEN_TTL;
use crate::services::{ServiceCredentialStore, VideoApiConfig};
use crate::video::{OAuthClient, VideoPlatformClient};

/// Lease row name guarding admin token refreshes.
pub const ADMIN_TOKEN_LEASE: &str = "video_admin_token";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminTokenState {
    /// No token stored
    Missing,
    /// No token stored, first grant in progress
    Minting,
    Valid,
    NearExpiry,
    /// Token near expiry, refresh in progress
    Refreshing,
}

/// Snapshot for the admin API.
#[derive(Clone, Debug, Serialize)]
pub struct AdminTokenStatus {
    pub state: AdminTokenState,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct AdminTokenManager {
    store: Arc<ServiceCredentialStore>,
    video: Arc<dyn VideoPlatformClient>,
    /// Identifies this process in the lease table
    holder: String,
    near_expiry_skew: Duration,
    lease_ttl: Duration,
    /// Serializes refreshes inside this process; the lease covers the rest
    refresh_gate: tokio::sync::Mutex<()>,
}

fn persistence(err: anyhow::Error) -> BridgeError {
    BridgeError::persistence(err)
}

impl AdminTokenManager {
    pub fn new(
        store: Arc<ServiceCredentialStore>,
        video: Arc<dyn VideoPlatformClient>,
        config: &AdminTokenConfig,
    ) -> Self {
        Self {
            store,
            video,
            holder: uuid::Uuid::new_v4().to_string(),
            near_expiry_skew: Duration::seconds(config.near_expiry_skew_secs),
            lease_ttl: Duration::seconds(config.lease_ttl_secs),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ServiceCredentialStore {
        &self.store
    }

    fn load_api(&self) -> Result<VideoApiConfig, BridgeError> {
        self.store
            .load()
            .map_err(persistence)?
            .video_api
            .ok_or_else(|| BridgeError::NotConfigured("video platform API".to_string()))
    }

    fn near_expiry(&self, api: &VideoApiConfig, now: DateTime<Utc>) -> bool {
        api.admin_token_expires_at
            .map_or(false, |expires_at| now + self.near_expiry_skew >= expires_at)
    }

    /// Stored token if one exists and is not near expiry.
    fn usable_token(&self, api: &VideoApiConfig) -> Result<Option<String>, BridgeError> {
        match &api.admin_access_token {
            Some(field) if !self.near_expiry(api, Utc::now()) => {
                self.store.reveal(field).map(Some).map_err(persistence)
            }
            _ => Ok(None),
        }
    }

    pub fn state(&self) -> Result<AdminTokenState, BridgeError> {
        let api = match self.load_api() {
            Ok(api) => api,
            Err(BridgeError::NotConfigured(_)) => return Ok(AdminTokenState::Missing),
            Err(e) => return Err(e),
        };
        let refreshing = self
            .store
            .lease_active(ADMIN_TOKEN_LEASE)
            .map_err(persistence)?;

        let state = match (&api.admin_access_token, self.near_expiry(&api, Utc::now())) {
            (None, _) if refreshing => AdminTokenState::Minting,
            (None, _) => AdminTokenState::Missing,
            (Some(_), true) if refreshing => AdminTokenState::Refreshing,
            (Some(_), true) => AdminTokenState::NearExpiry,
            (Some(_), false) => AdminTokenState::Valid,
        };
        Ok(state)
    }

    pub fn status(&self) -> Result<AdminTokenStatus, BridgeError> {
        let state = self.state()?;
        let expires_at = match self.load_api() {
            Ok(api) => api.admin_token_expires_at,
            Err(_) => None,
        };
        Ok(AdminTokenStatus { state, expires_at })
    }

    /// Returns a usable admin token, refreshing it first when near expiry.
    pub async fn access_token(&self) -> Result<String, BridgeError> {
        let api = self.load_api()?;
        if let Some(token) = self.usable_token(&api)? {
            return Ok(token);
        }
        self.refresh_under_lease(false).await
    }

    /// Manual trigger from the admin API.
    pub async fn force_refresh(&self) -> Result<(), BridgeError> {
        self.refresh_under_lease(true).await.map(|_| ())
    }

    /// OAuth client credentials, discovered and cached on first use.
    pub async fn oauth_client(&self) -> Result<OAuthClient, BridgeError> {
        let api = self.load_api()?;
        if let (Some(client_id), Some(secret)) = (&api.client_id, &api.client_secret) {
            return Ok(OAuthClient {
                client_id: client_id.clone(),
                client_secret: self.store.reveal(secret).map_err(persistence)?,
            });
        }

        let discovered = self.video.discover_client().await?;
        let sealed = self
            .store
            .seal(&discovered.client_secret)
            .map_err(persistence)?;
        let client_id = discovered.client_id.clone();
        self.store
            .update(move |config| {
                if let Some(api) = config.video_api.as_mut() {
                    api.client_id = Some(client_id);
                    api.client_secret = Some(sealed);
                }
                Ok(())
            })
            .map_err(persistence)?;
        info!(client_id = %discovered.client_id, "Discovered video platform OAuth client");
        Ok(discovered)
    }

    /// True when a grant could be attempted without operator input.
    pub fn can_obtain_token(&self) -> bool {
        match self.load_api() {
            Ok(api) => {
                api.admin_refresh_token.is_some()
                    || (api.admin_username.is_some() && api.admin_password.is_some())
            }
            Err(_) => false,
        }
    }

    async fn refresh_under_lease(&self, force: bool) -> Result<String, BridgeError> {
        let _gate = self.refresh_gate.lock().await;

        let acquired = self
            .store
            .try_acquire_lease(ADMIN_TOKEN_LEASE, &self.holder, self.lease_ttl)
            .map_err(persistence)?;
        if !acquired {
            let api = self.load_api()?;
            let unexpired = api
                .admin_token_expires_at
                .map_or(false, |expires_at| expires_at > Utc::now());
            return match &api.admin_access_token {
                Some(field) if unexpired => {
                    debug!("Admin token refresh held elsewhere; using stored token");
                    self.store.reveal(field).map_err(persistence)
                }
                _ => Err(BridgeError::DownstreamUnavailable(
                    "admin token refresh in progress".to_string(),
                )),
            };
        }

        let result = if force {
            self.refresh_locked().await
        } else {
            // A caller ahead of us on the gate or in another process may have
            // refreshed already.
            match self.load_api().and_then(|api| self.usable_token(&api)) {
                Ok(Some(token)) => {
                    debug!("Admin token refreshed by a concurrent caller");
                    Ok(token)
                }
                Ok(None) => self.refresh_locked().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = self.store.release_lease(ADMIN_TOKEN_LEASE, &self.holder) {
            warn!(error = %e, "Failed to release admin token lease");
        }
        result
    }

    async fn refresh_locked(&self) -> Result<String, BridgeError> {
        let api = self.load_api()?;
        let client = self.oauth_client().await?;

        let pair = match &api.admin_refresh_token {
            Some(field) => {
                let refresh_token = self.store.reveal(field).map_err(persistence)?;
                match self.video.refresh_grant(&client, &refresh_token).await {
                    Ok(pair) => pair,
                    Err(e) => match BridgeError::from(e) {
                        BridgeError::AuthRejected(reason) if api.admin_password.is_some() => {
                            warn!(reason = %reason, "Admin refresh token rejected; using password grant");
                            self.password_grant(&api, &client).await?
                        }
                        other => return Err(other),
                    },
                }
            }
            None => self.password_grant(&api, &client).await?,
        };

        self.persist(&pair)?;
        info!(expires_at = ?pair.expires_at, "Admin token refreshed");
        Ok(pair.access_token)
    }

    async fn password_grant(
        &self,
        api: &VideoApiConfig,
        client: &OAuthClient,
    ) -> Result<TokenPair, BridgeError> {
        let (Some(username), Some(password)) = (&api.admin_username, &api.admin_password) else {
            return Err(BridgeError::NotConfigured(
                "admin username and password".to_string(),
            ));
        };
        let password = self.store.reveal(password).map_err(persistence)?;
        Ok(self.video.password_grant(client, username, &password).await?)
    }

    fn persist(&self, pair: &TokenPair) -> Result<(), BridgeError> {
        let access = self.store.seal(&pair.access_token).map_err(persistence)?;
        let refresh = pair
            .refresh_token
            .as_deref()
            .map(|token| self.store.seal(token))
            .transpose()
            .map_err(persistence)?;
        let ttl = Duration::seconds(DEFAULT_TOKEN_TTL.as_secs() as i64);
        let expires_at = pair.expires_at.unwrap_or_else(|| Utc::now() + ttl);

        self.store
            .update(move |config| {
                let api = config
                    .video_api
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("video_api section removed during refresh"))?;
                api.admin_access_token = Some(access);
                if let Some(refresh) = refresh {
                    api.admin_refresh_token = Some(refresh);
                }
                api.admin_token_expires_at = Some(expires_at);
                Ok(())
            })
            .map_err(persistence)?;
        Ok(())
    }

    /// One pass of the background loop.
    pub async fn tick(&self) {
        let state = match self.state() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to read admin token state");
                return;
            }
        };
        let due = match state {
            AdminTokenState::NearExpiry => true,
            AdminTokenState::Missing => self.can_obtain_token(),
            _ => false,
        };
        if !due {
            return;
        }
        if let Err(e) = self.access_token().await {
            warn!(error = %e, ?state, "Proactive admin token refresh failed");
        }
    }
}

/// Background loop refreshing the admin token before it expires.
pub async fn run_admin_token_tick(manager: Arc<AdminTokenManager>, interval: std::time::Duration) {
    info!(
        interval_secs = interval.as_secs(),
        "Starting admin token tick"
    );
    let mut timer = tokio::time::interval(interval);
    loop {
        timer.tick().await;
        manager.tick().await;
    }
}
