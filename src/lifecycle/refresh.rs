//! Refresh of stored per-user tokens.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::LifecycleDeps;
use crate::credentials::TokenRecord;
use crate::error::BridgeError;

/// Assumed lifetime of a token stored without an expiry.
pub const DEFAULT_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed {
        access_token: String,
        expires_at: Option<DateTime<Utc>>,
    },
    NotNeeded,
}

/// True if the stored access token is missing or inside the skew window.
///
/// Rows without `expires_at` fall back to `last_activity + DEFAULT_TOKEN_TTL`.
pub fn needs_refresh(record: &TokenRecord, now: DateTime<Utc>, skew: Duration) -> bool {
    if record.access_token_enc.is_none() {
        return true;
    }
    match record.expires_at {
        Some(expires_at) => now + skew >= expires_at,
        None => {
            let ttl = Duration::seconds(DEFAULT_TOKEN_TTL.as_secs() as i64);
            now >= record.last_activity() + ttl - skew
        }
    }
}

pub struct RefreshEngine {
    deps: LifecycleDeps,
}

impl RefreshEngine {
    pub fn new(deps: LifecycleDeps) -> Self {
        Self { deps }
    }

    /// Refreshes the access token when it is close to expiry.
    ///
    /// Only the access token and its expiry are written; the stored refresh
    /// token is kept as is.
    pub async fn maybe_refresh(
        &self,
        forum_account_id: i64,
        record: &TokenRecord,
        skew: Duration,
    ) -> Result<RefreshOutcome, BridgeError> {
        if !needs_refresh(record, Utc::now(), skew) {
            return Ok(RefreshOutcome::NotNeeded);
        }

        let Some(refresh_enc) = &record.refresh_token_enc else {
            debug!(forum_account_id, "Token due for refresh but no refresh token stored");
            return Err(BridgeError::NoRefreshToken);
        };
        let refresh_token = self
            .deps
            .cipher
            .decrypt(refresh_enc)
            .map_err(BridgeError::persistence)?;

        let client = self.deps.admin.oauth_client().await?;
        let pair = self.deps.video.refresh_grant(&client, &refresh_token).await?;

        let access_enc = self
            .deps
            .cipher
            .encrypt(&pair.access_token)
            .map_err(BridgeError::persistence)?;
        self.deps
            .tokens
            .update_access(forum_account_id, &access_enc, pair.expires_at)
            .map_err(BridgeError::persistence)?;

        info!(forum_account_id, expires_at = ?pair.expires_at, "Refreshed video token");
        Ok(RefreshOutcome::Refreshed {
            access_token: pair.access_token,
            expires_at: pair.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Ciphertext;
    use crate::lifecycle::testing;
    use mockito::{Matcher, Server};

    fn record(expires_at: Option<DateTime<Utc>>, last_refresh_at: Option<DateTime<Utc>>) -> TokenRecord {
        let long_ago = Utc::now() - Duration::days(1);
        TokenRecord {
            forum_account_id: 5,
            video_account_id: None,
            access_token_enc: Some(Ciphertext::from_stored("x".to_string())),
            refresh_token_enc: None,
            expires_at,
            last_refresh_at,
            last_mint_at: None,
            last_mint_error: None,
            created_at: long_ago,
            updated_at: long_ago,
        }
    }

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let skew = Duration::seconds(60);
        assert!(needs_refresh(&record(Some(now + Duration::seconds(30)), None), now, skew));
        assert!(needs_refresh(&record(Some(now - Duration::seconds(1)), None), now, skew));
        assert!(!needs_refresh(&record(Some(now + Duration::hours(2)), None), now, skew));
    }

    #[test]
    fn test_legacy_ttl_window() {
        let now = Utc::now();
        let skew = Duration::seconds(60);
        assert!(!needs_refresh(
            &record(None, Some(now - Duration::minutes(10))),
            now,
            skew
        ));
        // 59.5 minutes old: inside the skew before the one-hour assumption ends
        assert!(needs_refresh(
            &record(None, Some(now - Duration::seconds(3570))),
            now,
            skew
        ));
        // No refresh or mint timestamps: falls back to updated_at, a day old
        assert!(needs_refresh(&record(None, None), now, skew));
    }

    #[test]
    fn test_missing_access_token_needs_refresh() {
        let mut row = record(Some(Utc::now() + Duration::hours(2)), None);
        row.access_token_enc = None;
        assert!(needs_refresh(&row, Utc::now(), Duration::zero()));
    }

    #[tokio::test]
    async fn test_not_needed_makes_no_request() {
        let deps = testing::deps("http://127.0.0.1:9");
        let engine = RefreshEngine::new(deps);
        let row = record(Some(Utc::now() + Duration::hours(2)), None);

        let outcome = engine
            .maybe_refresh(5, &row, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::NotNeeded);
    }

    #[tokio::test]
    async fn test_no_refresh_token() {
        let deps = testing::deps("http://127.0.0.1:9");
        let engine = RefreshEngine::new(deps);
        let row = record(Some(Utc::now() - Duration::seconds(5)), None);

        let err = engine
            .maybe_refresh(5, &row, Duration::seconds(60))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NoRefreshToken);
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/users/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a2","refresh_token":"r2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let deps = testing::deps(&server.url());
        let access = deps.cipher.encrypt("a1").unwrap();
        let refresh = deps.cipher.encrypt("r1").unwrap();
        let old_expiry = Utc::now() + Duration::seconds(30);
        deps.tokens.save(5, &access, Some(&refresh), Some(old_expiry)).unwrap();
        let row = deps.tokens.get(5).unwrap().unwrap();

        let engine = RefreshEngine::new(deps.clone());
        let outcome = engine
            .maybe_refresh(5, &row, Duration::seconds(60))
            .await
            .unwrap();

        let RefreshOutcome::Refreshed { access_token, expires_at } = outcome else {
            panic!("expected a refresh");
        };
        assert_eq!(access_token, "a2");
        assert!(expires_at.unwrap() > old_expiry);

        let stored = deps.tokens.get(5).unwrap().unwrap();
        assert_eq!(
            deps.cipher.decrypt(stored.access_token_enc.as_ref().unwrap()).unwrap(),
            "a2"
        );
        assert_eq!(
            deps.cipher.decrypt(stored.refresh_token_enc.as_ref().unwrap()).unwrap(),
            "r1"
        );
        assert!(stored.last_refresh_at.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_auth_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/users/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let deps = testing::deps(&server.url());
        let mut row = record(Some(Utc::now() - Duration::seconds(5)), None);
        row.refresh_token_enc = Some(deps.cipher.encrypt("revoked").unwrap());

        let err = RefreshEngine::new(deps)
            .maybe_refresh(5, &row, Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AuthRejected(_)));
    }
}
