//! First-time token issuance and server-side account repair.
//!
//! Minting needs the user's plaintext password, so it only runs inside a
//! login request. When the password grant fails, repair walks a fixed
//! sequence against the admin API and retries the grant once:
//!
//! 1. verify the mapped video account (discard it on username mismatch)
//! 2. find the account by exact username, or create it
//! 3. set its password to the captured one
//!
//! Steps run one after another; the first failing step ends the attempt and
//! its cause is appended to the recorded chain.

use std::fmt;
use tracing::{debug, info, warn};

use super::LifecycleDeps;
use crate::capture::RequestScope;
use crate::credentials::TokenPair;
use crate::directory::ForumUser;
use crate::error::BridgeError;
use crate::identity::username::{canonical_username, same_username, video_username};
use crate::identity::{IdentityRecord, IdentityStatus, NewIdentity};
use crate::video::NewVideoUser;

/// A failed repair step and its cause.
struct StepFailure {
    step: &'static str,
    error: BridgeError,
}

impl StepFailure {
    fn new(step: &'static str, error: impl Into<BridgeError>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Address used when the forum email already belongs to another video
/// account: `local+fa<id>@domain`.
pub fn synthesize_email(email: &str, forum_account_id: i64) -> String {
    match email.rsplit_once('@') {
        Some((local, domain)) => format!("{}+fa{}@{}", local, forum_account_id, domain),
        None => format!("{}+fa{}", email, forum_account_id),
    }
}

/// Who is being minted for.
struct MintTarget {
    identity: IdentityRecord,
    username: String,
    email: String,
}

pub struct MintEngine {
    deps: LifecycleDeps,
}

impl MintEngine {
    pub fn new(deps: LifecycleDeps) -> Self {
        Self { deps }
    }

    /// Obtains a fresh token pair with the password captured in `scope`.
    ///
    /// Without a captured credential nothing is written and
    /// [`BridgeError::NoCredentialInScope`] is returned. Any other failure is
    /// recorded on the identity and token rows before it is returned.
    pub async fn mint(
        &self,
        scope: &RequestScope,
        host_account_id: i64,
        forum_account_id: i64,
    ) -> Result<TokenPair, BridgeError> {
        let login = match self.deps.host.get(host_account_id) {
            Ok(account) => account.map(|account| canonical_username(&account.login)),
            Err(e) => {
                debug!(host_account_id, error = %e, "Host account lookup failed");
                None
            }
        };
        let Some(password) = scope.password_for(host_account_id, login.as_deref()) else {
            debug!(host_account_id, forum_account_id, "No captured credential; cannot mint");
            return Err(BridgeError::NoCredentialInScope);
        };

        let result = self
            .mint_with_password(host_account_id, forum_account_id, password)
            .await;
        if let Err(e) = &result {
            self.record_failure(forum_account_id, e);
        }
        result
    }

    async fn mint_with_password(
        &self,
        host_account_id: i64,
        forum_account_id: i64,
        password: &str,
    ) -> Result<TokenPair, BridgeError> {
        let target = self.target(host_account_id, forum_account_id)?;
        let client = self.deps.admin.oauth_client().await?;

        let first_error = match self
            .deps
            .video
            .password_grant(&client, &target.username, password)
            .await
        {
            Ok(pair) => {
                let video_account_id = match target.identity.video_account_id {
                    Some(id) => Some(id),
                    None => self.lookup_video_account(&target.username).await,
                };
                self.persist(forum_account_id, video_account_id, &pair)?;
                info!(forum_account_id, "Minted video token");
                return Ok(pair);
            }
            Err(e) => BridgeError::from(e),
        };

        if !matches!(first_error, BridgeError::AuthRejected(_)) {
            return Err(first_error);
        }
        warn!(
            forum_account_id,
            error = %first_error,
            "Password grant rejected; repairing video account"
        );

        let mut chain = vec![format!("password_grant: {}", first_error)];
        let video_account_id = match self.repair(&target, password).await {
            Ok(id) => id,
            Err(failure) => {
                chain.push(failure.to_string());
                return Err(BridgeError::RepairFailed {
                    chain: chain.join(" -> "),
                });
            }
        };

        match self
            .deps
            .video
            .password_grant(&client, &target.username, password)
            .await
        {
            Ok(pair) => {
                self.persist(forum_account_id, Some(video_account_id), &pair)?;
                info!(forum_account_id, video_account_id, "Repaired video account and minted token");
                Ok(pair)
            }
            Err(e) => {
                chain.push(StepFailure::new("retry_grant", e).to_string());
                Err(BridgeError::RepairFailed {
                    chain: chain.join(" -> "),
                })
            }
        }
    }

    /// Loads (or creates) the identity row and derives the video username.
    fn target(&self, host_account_id: i64, forum_account_id: i64) -> Result<MintTarget, BridgeError> {
        let forum_user: Option<ForumUser> = match self.deps.forum.get_user(forum_account_id) {
            Ok(user) => user,
            Err(e) => {
                debug!(forum_account_id, error = %e, "Forum user lookup failed");
                None
            }
        };

        let identity = self
            .deps
            .identities
            .ensure(&NewIdentity {
                forum_account_id,
                host_account_id: Some(host_account_id),
                forum_username_normalized: forum_user
                    .as_ref()
                    .map(|user| user.username_normalized.clone())
                    .unwrap_or_default(),
                email: forum_user
                    .as_ref()
                    .map(|user| user.email.clone())
                    .unwrap_or_default(),
            })
            .map_err(BridgeError::persistence)?;

        let forum_username = forum_user
            .as_ref()
            .map(|user| user.username.as_str())
            .unwrap_or(identity.forum_username_normalized.as_str());
        let username = video_username(forum_username).ok_or_else(|| {
            BridgeError::AuthRejected(format!(
                "forum account {} has no username usable on the video platform",
                forum_account_id
            ))
        })?;
        let email = forum_user
            .map(|user| user.email)
            .filter(|email| !email.is_empty())
            .unwrap_or_else(|| identity.email.clone());

        Ok(MintTarget {
            identity,
            username,
            email,
        })
    }

    async fn repair(&self, target: &MintTarget, password: &str) -> Result<i64, StepFailure> {
        let forum_account_id = target.identity.forum_account_id;
        let admin_token = self
            .deps
            .admin
            .access_token()
            .await
            .map_err(|e| StepFailure::new("admin_token", e))?;

        let mut video_account_id = None;
        if let Some(mapped) = target.identity.video_account_id {
            match self.deps.video.get_user(&admin_token, mapped).await {
                Ok(Some(user)) if same_username(&user.username, &target.username) => {
                    debug!(forum_account_id, video_account_id = mapped, "Mapped video account verified");
                    video_account_id = Some(mapped);
                }
                Ok(Some(user)) => {
                    let mismatch = BridgeError::MappingMismatch {
                        video_account_id: mapped,
                        expected: target.username.clone(),
                        actual: user.username,
                    };
                    warn!(forum_account_id, error = %mismatch, "Discarding mismatched video mapping");
                    self.clear_mapping(forum_account_id)?;
                }
                Ok(None) => {
                    warn!(forum_account_id, video_account_id = mapped, "Mapped video account no longer exists");
                    self.clear_mapping(forum_account_id)?;
                }
                Err(e) => return Err(StepFailure::new("verify_mapping", e)),
            }
        }

        let video_account_id = match video_account_id {
            Some(id) => id,
            None => self.find_or_create(&admin_token, target, password).await?,
        };

        self.deps
            .video
            .set_password(&admin_token, video_account_id, password)
            .await
            .map_err(|e| StepFailure::new("set_password", e))?;
        debug!(forum_account_id, video_account_id, "Video account password synchronized");

        Ok(video_account_id)
    }

    fn clear_mapping(&self, forum_account_id: i64) -> Result<(), StepFailure> {
        let cleared = self
            .deps
            .identities
            .set_video_account(forum_account_id, None)
            .and_then(|_| self.deps.tokens.set_video_account(forum_account_id, None));
        cleared.map_err(|e| StepFailure::new("clear_mapping", BridgeError::persistence(e)))
    }

    async fn find_or_create(
        &self,
        admin_token: &str,
        target: &MintTarget,
        password: &str,
    ) -> Result<i64, StepFailure> {
        let forum_account_id = target.identity.forum_account_id;
        let existing = self
            .deps
            .video
            .search_users(admin_token, &target.username)
            .await
            .map_err(|e| StepFailure::new("search", e))?
            .into_iter()
            .find(|user| same_username(&user.username, &target.username));
        if let Some(user) = existing {
            info!(forum_account_id, video_account_id = user.id, "Found video account by username");
            return Ok(user.id);
        }

        let email = self.creation_email(admin_token, target).await?;
        let api = self
            .deps
            .admin
            .store()
            .video_api()
            .map_err(|e| StepFailure::new("create", BridgeError::persistence(e)))?;
        let new_user = NewVideoUser {
            username: target.username.clone(),
            email,
            password: password.to_string(),
            role: api.new_account_role,
            video_quota: api.new_account_video_quota,
        };
        let id = self
            .deps
            .video
            .create_user(admin_token, &new_user)
            .await
            .map_err(|e| StepFailure::new("create", e))?;
        info!(forum_account_id, video_account_id = id, "Created video account");
        Ok(id)
    }

    /// The forum email, or a per-account alias when another video account
    /// already uses it.
    async fn creation_email(&self, admin_token: &str, target: &MintTarget) -> Result<String, StepFailure> {
        if target.email.is_empty() {
            return Ok(String::new());
        }
        let taken = self
            .deps
            .video
            .search_users(admin_token, &target.email)
            .await
            .map_err(|e| StepFailure::new("email_check", e))?
            .iter()
            .any(|user| {
                user.email
                    .as_deref()
                    .map_or(false, |email| email.eq_ignore_ascii_case(&target.email))
            });
        if !taken {
            return Ok(target.email.clone());
        }
        let alias = synthesize_email(&target.email, target.identity.forum_account_id);
        debug!(
            forum_account_id = target.identity.forum_account_id,
            "Forum email already used on the video platform; using alias"
        );
        Ok(alias)
    }

    /// Best-effort discovery of the video account id after a direct grant.
    async fn lookup_video_account(&self, username: &str) -> Option<i64> {
        let admin_token = match self.deps.admin.access_token().await {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "No admin token; video account id stays unknown");
                return None;
            }
        };
        match self.deps.video.search_users(&admin_token, username).await {
            Ok(users) => users
                .into_iter()
                .find(|user| same_username(&user.username, username))
                .map(|user| user.id),
            Err(e) => {
                debug!(error = %e, "Video account lookup failed");
                None
            }
        }
    }

    fn persist(
        &self,
        forum_account_id: i64,
        video_account_id: Option<i64>,
        pair: &TokenPair,
    ) -> Result<(), BridgeError> {
        let access = self
            .deps
            .cipher
            .encrypt(&pair.access_token)
            .map_err(BridgeError::persistence)?;
        let refresh = pair
            .refresh_token
            .as_deref()
            .map(|token| self.deps.cipher.encrypt(token))
            .transpose()
            .map_err(BridgeError::persistence)?;

        self.deps
            .tokens
            .save(forum_account_id, &access, refresh.as_ref(), pair.expires_at)
            .map_err(BridgeError::persistence)?;

        if let Some(video_account_id) = video_account_id {
            self.deps
                .identities
                .set_video_account(forum_account_id, Some(video_account_id))
                .and_then(|_| {
                    self.deps
                        .tokens
                        .set_video_account(forum_account_id, Some(video_account_id))
                })
                .map_err(BridgeError::persistence)?;
        }
        self.deps
            .identities
            .record_error(forum_account_id, None)
            .map_err(BridgeError::persistence)?;

        let identity = self
            .deps
            .identities
            .get(forum_account_id)
            .map_err(BridgeError::persistence)?;
        if let Some(identity) = identity {
            let linkable = identity.host_account_id.is_some()
                && identity.video_account_id.is_some()
                && identity.status == IdentityStatus::Partial;
            if linkable {
                self.deps
                    .identities
                    .set_status(forum_account_id, IdentityStatus::Linked)
                    .map_err(BridgeError::persistence)?;
            }
        }
        Ok(())
    }

    fn record_failure(&self, forum_account_id: i64, error: &BridgeError) {
        warn!(
            forum_account_id,
            error = %error,
            transient = error.is_transient(),
            "Video token mint failed"
        );
        let message = error.to_string();
        if let Err(e) = self.deps.tokens.touch_mint_error(forum_account_id, &message) {
            warn!(forum_account_id, error = %e, "Failed to record mint error on token row");
        }
        if let Err(e) = self.deps.identities.record_error(forum_account_id, Some(&message)) {
            warn!(forum_account_id, error = %e, "Failed to record mint error on identity");
        }
    }
}
