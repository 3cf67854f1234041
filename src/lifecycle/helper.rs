//! Entry point for features that need a user's video platform token.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{LifecycleDeps, MintEngine, RefreshEngine, RefreshOutcome};
use crate::capture::RequestScope;
use crate::identity::{IdentityResolver, IdentityStatus};

/// Result of [`TokenHelper::complete_login`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub forum_account_id: Option<i64>,
    pub linked: bool,
    pub has_token: bool,
}

pub struct TokenHelper {
    deps: LifecycleDeps,
    resolver: Arc<IdentityResolver>,
    mint: MintEngine,
    refresh: RefreshEngine,
    refresh_skew: Duration,
}

impl TokenHelper {
    pub fn new(deps: LifecycleDeps, resolver: Arc<IdentityResolver>, refresh_skew: Duration) -> Self {
        Self {
            mint: MintEngine::new(deps.clone()),
            refresh: RefreshEngine::new(deps.clone()),
            deps,
            resolver,
            refresh_skew,
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Returns a usable access token for the host account, or `None`.
    ///
    /// Stored tokens are refreshed as needed. A new token is minted only when
    /// `scope` carries the password captured during this login request.
    /// Failures are logged and recorded, never returned.
    pub async fn token_for_request(&self, scope: &RequestScope, host_account_id: i64) -> Option<String> {
        let forum_account_id = self.resolver.resolve(host_account_id).forum_account_id()?;
        self.token_for_forum_account(scope, host_account_id, forum_account_id)
            .await
    }

    async fn token_for_forum_account(
        &self,
        scope: &RequestScope,
        host_account_id: i64,
        forum_account_id: i64,
    ) -> Option<String> {
        match self.deps.identities.get(forum_account_id) {
            Ok(Some(identity)) if identity.status == IdentityStatus::Disabled => {
                debug!(forum_account_id, "Identity disabled; no video token");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(forum_account_id, error = %e, "Failed to load identity");
            }
        }

        if let Some(token) = self.stored_token(forum_account_id).await {
            return Some(token);
        }

        if !scope.has_credential() {
            debug!(forum_account_id, "No usable token and not a login request");
            return None;
        }

        match self.mint.mint(scope, host_account_id, forum_account_id).await {
            Ok(pair) => Some(pair.access_token),
            Err(e) => {
                debug!(forum_account_id, error = %e, "Mint did not produce a token");
                None
            }
        }
    }

    /// Stored token, refreshed first when due.
    async fn stored_token(&self, forum_account_id: i64) -> Option<String> {
        let record = match self.deps.tokens.get(forum_account_id) {
            Ok(record) => record?,
            Err(e) => {
                warn!(forum_account_id, error = %e, "Failed to load stored token");
                return None;
            }
        };
        let access_enc = record.access_token_enc.as_ref()?;

        match self
            .refresh
            .maybe_refresh(forum_account_id, &record, self.refresh_skew)
            .await
        {
            Ok(RefreshOutcome::Refreshed { access_token, .. }) => Some(access_token),
            Ok(RefreshOutcome::NotNeeded) => match self.deps.cipher.decrypt(access_enc) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(forum_account_id, error = %e, "Stored token could not be decrypted");
                    None
                }
            },
            Err(e) => {
                warn!(forum_account_id, error = %e, "Token refresh failed");
                if let Err(record_err) = self
                    .deps
                    .identities
                    .record_error(forum_account_id, Some(&format!("refresh: {}", e)))
                {
                    warn!(forum_account_id, error = %record_err, "Failed to record refresh error");
                }
                None
            }
        }
    }

    /// Login hook: captures the password, then tries to obtain a token while
    /// the password is available. Never fails the login.
    pub async fn complete_login(
        &self,
        scope: &mut RequestScope,
        host_account_id: i64,
        password: &str,
        identifier: &str,
    ) -> LoginOutcome {
        scope.capture(host_account_id, password, identifier);

        let Some(forum_account_id) = self.resolver.resolve(host_account_id).forum_account_id() else {
            return LoginOutcome {
                forum_account_id: None,
                linked: false,
                has_token: false,
            };
        };

        let token = self
            .token_for_forum_account(scope, host_account_id, forum_account_id)
            .await;
        let linked = matches!(
            self.deps.identities.get(forum_account_id),
            Ok(Some(identity)) if identity.status == IdentityStatus::Linked
        );

        LoginOutcome {
            forum_account_id: Some(forum_account_id),
            linked,
            has_token: token.is_some(),
        }
    }
}
