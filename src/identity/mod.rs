//! Cross-system identity map.
//!
//! The forum account id is canonical: every host account and every
//! video-platform account is linked through one [`IdentityRecord`] keyed by it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::credentials::TokenStore;

pub mod resolver;
mod store;
pub mod username;

pub use resolver::{
    IdentityResolver, NoopResolverHook, Resolution, ResolutionSource, ResolverHook,
};
pub use store::SqliteIdentityStore;

/// Link state of an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    /// Host and video accounts both attached
    Linked,
    /// Known forum account, link incomplete
    Partial,
    /// Excluded from token issuance
    Disabled,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Linked => "linked",
            IdentityStatus::Partial => "partial",
            IdentityStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linked" => Ok(IdentityStatus::Linked),
            "partial" => Ok(IdentityStatus::Partial),
            "disabled" => Ok(IdentityStatus::Disabled),
            other => Err(anyhow!("Unknown identity status '{}'", other)),
        }
    }
}

/// One row of the identity map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub forum_account_id: i64,
    pub host_account_id: Option<i64>,
    pub video_account_id: Option<i64>,
    pub forum_username_normalized: String,
    pub email: String,
    pub status: IdentityStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for creating an identity row.
#[derive(Clone, Debug)]
pub struct NewIdentity {
    pub forum_account_id: i64,
    pub host_account_id: Option<i64>,
    pub forum_username_normalized: String,
    pub email: String,
}

/// Storage contract for the identity map.
pub trait IdentityStore: Send + Sync {
    fn get(&self, forum_account_id: i64) -> Result<Option<IdentityRecord>>;

    fn find_by_host(&self, host_account_id: i64) -> Result<Option<IdentityRecord>>;

    /// Inserts the row with status `partial` if missing. When a host id is
    /// given it is attached (moved off any other row). Returns the stored row.
    fn ensure(&self, identity: &NewIdentity) -> Result<IdentityRecord>;

    /// Attaches a host account, detaching it from any other forum account.
    fn link_host(&self, forum_account_id: i64, host_account_id: i64) -> Result<()>;

    /// Sets or clears the linked video account. Clearing demotes `linked`
    /// rows to `partial`.
    fn set_video_account(&self, forum_account_id: i64, video_account_id: Option<i64>)
        -> Result<()>;

    /// `linked` requires both host and video ids to be present.
    fn set_status(&self, forum_account_id: i64, status: IdentityStatus) -> Result<()>;

    /// Stores a truncated error, or clears it with `None`.
    fn record_error(&self, forum_account_id: i64, message: Option<&str>) -> Result<()>;

    fn delete(&self, forum_account_id: i64) -> Result<bool>;
}

/// Account-deletion flow: removes the identity row and its tokens.
pub fn delete_account(
    identities: &dyn IdentityStore,
    tokens: &dyn TokenStore,
    forum_account_id: i64,
) -> Result<bool> {
    let removed_tokens = tokens.delete(forum_account_id)?;
    let removed_identity = identities.delete(forum_account_id)?;
    tracing::info!(
        forum_account_id,
        removed_identity,
        removed_tokens,
        "Deleted identity"
    );
    Ok(removed_identity || removed_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{SecretCipher, SqliteTokenStore};

    #[test]
    fn test_status_roundtrip_names() {
        for status in [
            IdentityStatus::Linked,
            IdentityStatus::Partial,
            IdentityStatus::Disabled,
        ] {
            assert_eq!(status.as_str().parse::<IdentityStatus>().unwrap(), status);
        }
        assert!("gone".parse::<IdentityStatus>().is_err());
    }

    #[test]
    fn test_delete_account_cascades_tokens() {
        let identities = SqliteIdentityStore::new(":memory:").unwrap();
        let tokens = SqliteTokenStore::new(":memory:").unwrap();
        let cipher = SecretCipher::from_site_secret("secret").unwrap();

        identities
            .ensure(&NewIdentity {
                forum_account_id: 9,
                host_account_id: Some(90),
                forum_username_normalized: "carol".to_string(),
                email: "carol@example.com".to_string(),
            })
            .unwrap();
        tokens.save(9, &cipher.encrypt("t").unwrap(), None, None).unwrap();

        assert!(delete_account(&identities, &tokens, 9).unwrap());
        assert!(identities.get(9).unwrap().is_none());
        assert!(tokens.get(9).unwrap().is_none());
        assert!(!delete_account(&identities, &tokens, 9).unwrap());
    }
}
