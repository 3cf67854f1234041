//! Per-downstream-system configuration with individually encrypted secrets.
//!
//! The whole configuration is one versioned JSON blob. Secret fields carry an
//! encryption marker (`{"$enc": "..."}`) and are only ever decrypted on use.
//! Updates follow "blank on save means keep existing" for every secret.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::{Ciphertext, SecretCipher};
use crate::db::validate_identifier;

mod store;

pub use store::ServiceCredentialStore;

/// Encrypted secret value as stored in the configuration blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretField {
    #[serde(rename = "$enc")]
    enc: Ciphertext,
}

impl SecretField {
    pub fn seal(cipher: &SecretCipher, plaintext: &str) -> Result<Self> {
        Ok(Self {
            enc: cipher.encrypt(plaintext)?,
        })
    }

    pub fn open(&self, cipher: &SecretCipher) -> Result<String> {
        cipher.decrypt(&self.enc)
    }
}

/// Forum engine users table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumDbConfig {
    /// SQLite database path
    pub path: String,
    #[serde(default = "default_forum_users_table")]
    pub users_table: String,
    #[serde(default = "default_forum_id_column")]
    pub id_column: String,
    #[serde(default = "default_forum_username_column")]
    pub username_column: String,
    #[serde(default = "default_forum_normalized_column")]
    pub normalized_column: String,
    #[serde(default = "default_forum_email_column")]
    pub email_column: String,
}

fn default_forum_users_table() -> String {
    "users".to_string()
}

fn default_forum_id_column() -> String {
    "user_id".to_string()
}

fn default_forum_username_column() -> String {
    "username".to_string()
}

fn default_forum_normalized_column() -> String {
    "username_clean".to_string()
}

fn default_forum_email_column() -> String {
    "user_email".to_string()
}

impl ForumDbConfig {
    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(anyhow!("forum_db.path must not be empty"));
        }
        for ident in [
            &self.users_table,
            &self.id_column,
            &self.username_column,
            &self.normalized_column,
            &self.email_column,
        ] {
            validate_identifier(ident).context("forum_db")?;
        }
        Ok(())
    }
}

/// Video platform accounts table (read-only diagnostics).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDbConfig {
    /// SQLite database path, opened read-only
    pub path: String,
    #[serde(default = "default_video_accounts_table")]
    pub accounts_table: String,
    #[serde(default = "default_video_blocked_column")]
    pub blocked_column: String,
    #[serde(default = "default_video_email_verified_column")]
    pub email_verified_column: String,
}

fn default_video_accounts_table() -> String {
    "user".to_string()
}

fn default_video_blocked_column() -> String {
    "blocked".to_string()
}

fn default_video_email_verified_column() -> String {
    "emailVerified".to_string()
}

impl VideoDbConfig {
    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(anyhow!("video_db.path must not be empty"));
        }
        for ident in [
            &self.accounts_table,
            &self.blocked_column,
            &self.email_verified_column,
        ] {
            validate_identifier(ident).context("video_db")?;
        }
        Ok(())
    }
}

/// Video platform HTTP API client, including the persisted admin token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoApiConfig {
    /// e.g. `https://video.example.org`
    pub base_url: String,
    /// OAuth client id; discovered on first use when absent
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<SecretField>,
    #[serde(default)]
    pub admin_username: Option<String>,
    #[serde(default)]
    pub admin_password: Option<SecretField>,
    #[serde(default)]
    pub admin_access_token: Option<SecretField>,
    #[serde(default)]
    pub admin_refresh_token: Option<SecretField>,
    #[serde(default)]
    pub admin_token_expires_at: Option<DateTime<Utc>>,
    /// Role assigned to accounts created by repair
    #[serde(default = "default_new_account_role")]
    pub new_account_role: i32,
    /// Video quota in bytes for accounts created by repair (-1 = unlimited)
    #[serde(default = "default_new_account_video_quota")]
    pub new_account_video_quota: i64,
}

fn default_new_account_role() -> i32 {
    2
}

fn default_new_account_video_quota() -> i64 {
    -1
}

impl VideoApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: None,
            client_secret: None,
            admin_username: None,
            admin_password: None,
            admin_access_token: None,
            admin_refresh_token: None,
            admin_token_expires_at: None,
            new_account_role: default_new_account_role(),
            new_account_video_quota: default_new_account_video_quota(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(anyhow!(
                "video_api.base_url must be an http(s) URL, got '{}'",
                self.base_url
            ));
        }
        if self.client_secret.is_some() && self.client_id.is_none() {
            return Err(anyhow!("video_api.client_secret set without client_id"));
        }
        Ok(())
    }

    /// Drops the persisted admin token pair.
    pub fn clear_admin_token(&mut self) {
        self.admin_access_token = None;
        self.admin_refresh_token = None;
        self.admin_token_expires_at = None;
    }
}

/// Complete downstream configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Incremented on every write
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub forum_db: Option<ForumDbConfig>,
    #[serde(default)]
    pub video_db: Option<VideoDbConfig>,
    #[serde(default)]
    pub video_api: Option<VideoApiConfig>,
}

impl ServiceConfig {
    /// Checks every configured section. Called on load and before each write.
    pub fn validate(&self) -> Result<()> {
        if let Some(forum) = &self.forum_db {
            forum.validate()?;
        }
        if let Some(video_db) = &self.video_db {
            video_db.validate()?;
        }
        if let Some(api) = &self.video_api {
            api.validate()?;
        }
        Ok(())
    }

    /// Applies a settings-screen update. Blank or absent secrets keep the
    /// stored value.
    pub fn apply_update(&mut self, update: ServiceConfigUpdate, cipher: &SecretCipher) -> Result<()> {
        if let Some(forum) = update.forum_db {
            self.forum_db = Some(forum);
        }
        if let Some(video_db) = update.video_db {
            self.video_db = Some(video_db);
        }
        if let Some(api_update) = update.video_api {
            let base_url = api_update
                .base_url
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| self.video_api.as_ref().map(|a| a.base_url.clone()))
                .ok_or_else(|| anyhow!("video_api.base_url is required"))?;

            let api = self
                .video_api
                .get_or_insert_with(|| VideoApiConfig::new(base_url.clone()));
            api.base_url = base_url;

            if let Some(client_id) = non_blank(api_update.client_id) {
                if api.client_id.as_deref() != Some(client_id.as_str()) {
                    api.client_secret = None;
                }
                api.client_id = Some(client_id);
            }
            if let Some(secret) = non_blank(api_update.client_secret) {
                api.client_secret = Some(SecretField::seal(cipher, &secret)?);
            }
            if let Some(username) = non_blank(api_update.admin_username) {
                if api.admin_username.as_deref() != Some(username.as_str()) {
                    // Tokens belong to the previous admin account
                    api.clear_admin_token();
                }
                api.admin_username = Some(username);
            }
            if let Some(password) = non_blank(api_update.admin_password) {
                api.admin_password = Some(SecretField::seal(cipher, &password)?);
            }
            if let Some(role) = api_update.new_account_role {
                api.new_account_role = role;
            }
            if let Some(quota) = api_update.new_account_video_quota {
                api.new_account_video_quota = quota;
            }
        }
        self.validate()
    }

    /// Settings-screen view without secret values.
    pub fn redacted(&self) -> ServiceConfigView {
        ServiceConfigView {
            version: self.version,
            forum_db: self.forum_db.clone(),
            video_db: self.video_db.clone(),
            video_api: self.video_api.as_ref().map(|api| VideoApiView {
                base_url: api.base_url.clone(),
                client_id: api.client_id.clone(),
                client_secret_configured: api.client_secret.is_some(),
                admin_username: api.admin_username.clone(),
                admin_password_configured: api.admin_password.is_some(),
                admin_token_configured: api.admin_access_token.is_some(),
                admin_token_expires_at: api.admin_token_expires_at,
                new_account_role: api.new_account_role,
                new_account_video_quota: api.new_account_video_quota,
            }),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Partial update from the settings screen.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfigUpdate {
    #[serde(default)]
    pub forum_db: Option<ForumDbConfig>,
    #[serde(default)]
    pub video_db: Option<VideoDbConfig>,
    #[serde(default)]
    pub video_api: Option<VideoApiUpdate>,
}

/// Plaintext secrets as typed into the settings screen.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VideoApiUpdate {
    pub base_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub new_account_role: Option<i32>,
    pub new_account_video_quota: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceConfigView {
    pub version: u64,
    pub forum_db: Option<ForumDbConfig>,
    pub video_db: Option<VideoDbConfig>,
    pub video_api: Option<VideoApiView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoApiView {
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret_configured: bool,
    pub admin_username: Option<String>,
    pub admin_password_configured: bool,
    pub admin_token_configured: bool,
    pub admin_token_expires_at: Option<DateTime<Utc>>,
    pub new_account_role: i32,
    pub new_account_video_quota: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_site_secret("test-secret").unwrap()
    }

    fn api_update(password: Option<&str>) -> ServiceConfigUpdate {
        ServiceConfigUpdate {
            video_api: Some(VideoApiUpdate {
                base_url: Some("https://video.example.org".to_string()),
                admin_username: Some("root".to_string()),
                admin_password: password.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_blank_secret_keeps_existing() {
        let cipher = cipher();
        let mut config = ServiceConfig::default();
        config.apply_update(api_update(Some("hunter2")), &cipher).unwrap();
        let stored = config.video_api.as_ref().unwrap().admin_password.clone();

        config.apply_update(api_update(Some("   ")), &cipher).unwrap();
        assert_eq!(config.video_api.as_ref().unwrap().admin_password, stored);

        config.apply_update(api_update(None), &cipher).unwrap();
        let api = config.video_api.as_ref().unwrap();
        assert_eq!(api.admin_password.as_ref().unwrap().open(&cipher).unwrap(), "hunter2");
    }

    #[test]
    fn test_new_secret_replaces_existing() {
        let cipher = cipher();
        let mut config = ServiceConfig::default();
        config.apply_update(api_update(Some("first")), &cipher).unwrap();
        config.apply_update(api_update(Some("second")), &cipher).unwrap();

        let api = config.video_api.unwrap();
        assert_eq!(api.admin_password.unwrap().open(&cipher).unwrap(), "second");
    }

    #[test]
    fn test_changing_admin_user_drops_admin_token() {
        let cipher = cipher();
        let mut config = ServiceConfig::default();
        config.apply_update(api_update(None), &cipher).unwrap();
        config.video_api.as_mut().unwrap().admin_access_token =
            Some(SecretField::seal(&cipher, "tok").unwrap());

        let mut update = api_update(None);
        update.video_api.as_mut().unwrap().admin_username = Some("other".to_string());
        config.apply_update(update, &cipher).unwrap();

        assert!(config.video_api.unwrap().admin_access_token.is_none());
    }

    #[test]
    fn test_secret_fields_carry_encryption_marker() {
        let cipher = cipher();
        let mut config = ServiceConfig::default();
        config.apply_update(api_update(Some("hunter2")), &cipher).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"$enc\""));
        assert!(!json.contains("hunter2"));

        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rejects_bad_sections() {
        let mut config = ServiceConfig::default();
        config.video_api = Some(VideoApiConfig::new("ftp://nope"));
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.forum_db = Some(ForumDbConfig {
            path: "forum.db".to_string(),
            users_table: "users; --".to_string(),
            id_column: default_forum_id_column(),
            username_column: default_forum_username_column(),
            normalized_column: default_forum_normalized_column(),
            email_column: default_forum_email_column(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forum_defaults_from_json() {
        let forum: ForumDbConfig = serde_json::from_str(r#"{"path": "forum.db"}"#).unwrap();
        assert_eq!(forum.users_table, "users");
        assert_eq!(forum.normalized_column, "username_clean");
    }

    #[test]
    fn test_redacted_view_hides_secrets() {
        let cipher = cipher();
        let mut config = ServiceConfig::default();
        config.apply_update(api_update(Some("hunter2")), &cipher).unwrap();

        let view = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!view.contains("$enc"));
        assert!(view.contains("\"admin_password_configured\":true"));
        assert!(view.contains("\"client_secret_configured\":false"));
    }
}
