//! Durable storage for [`ServiceConfig`] and short-lived refresh leases.
//!
//! This store is the cross-process source of truth for the admin service
//! token: every worker reads and writes it here rather than caching it.

use super::{SecretField, ServiceConfig, ServiceConfigUpdate};
use crate::credentials::SecretCipher;
use crate::db;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Persists the service configuration blob and leases in SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE service_config (
///     id         INTEGER PRIMARY KEY CHECK (id = 1),
///     version    INTEGER NOT NULL,
///     blob       TEXT NOT NULL,   -- JSON, secrets as {"$enc": ...}
///     updated_at TEXT NOT NULL
/// );
/// CREATE TABLE service_leases (
///     name       TEXT PRIMARY KEY,
///     holder     TEXT NOT NULL,
///     expires_at INTEGER NOT NULL  -- unix millis
/// );
/// ```
pub struct ServiceCredentialStore {
    conn: Mutex<Connection>,
    cipher: SecretCipher,
}

impl ServiceCredentialStore {
    /// Opens (or creates) the SQLite database and ensures the tables exist.
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: SecretCipher) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open service config database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS service_config (
                id         INTEGER PRIMARY KEY CHECK (id = 1),
                version    INTEGER NOT NULL,
                blob       TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS service_leases (
                name       TEXT PRIMARY KEY,
                holder     TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )
        .context("Failed to create service config tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Decrypts a secret field from the loaded configuration.
    pub fn reveal(&self, field: &SecretField) -> Result<String> {
        field.open(&self.cipher)
    }

    /// Encrypts a plaintext secret for storage in the configuration.
    pub fn seal(&self, plaintext: &str) -> Result<SecretField> {
        SecretField::seal(&self.cipher, plaintext)
    }

    /// Loads and validates the configuration. Missing row = empty config.
    pub fn load(&self) -> Result<ServiceConfig> {
        let conn = db::lock(&self.conn)?;
        Self::load_from(&conn)
    }

    fn load_from(conn: &Connection) -> Result<ServiceConfig> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, blob FROM service_config WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read service config")?;

        let Some((version, blob)) = row else {
            return Ok(ServiceConfig::default());
        };

        let mut config: ServiceConfig =
            serde_json::from_str(&blob).context("Service config blob is not valid JSON")?;
        config.version = version as u64;
        config
            .validate()
            .context("Stored service config failed validation")?;
        Ok(config)
    }

    /// Read-modify-write under one transaction. Bumps the version.
    pub fn update<F>(&self, mutate: F) -> Result<ServiceConfig>
    where
        F: FnOnce(&mut ServiceConfig) -> Result<()>,
    {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let mut config = Self::load_from(&tx)?;
        mutate(&mut config)?;
        config.validate()?;
        config.version += 1;

        let blob = serde_json::to_string(&config).context("Failed to serialize service config")?;
        tx.execute(
            "INSERT INTO service_config (id, version, blob, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                blob = excluded.blob,
                updated_at = excluded.updated_at",
            params![config.version as i64, blob, Utc::now().to_rfc3339()],
        )
        .context("Failed to write service config")?;
        tx.commit().context("Failed to commit service config")?;

        Ok(config)
    }

    /// Applies a settings-screen update (blank secrets keep existing).
    pub fn apply_update(&self, update: ServiceConfigUpdate) -> Result<ServiceConfig> {
        let cipher = self.cipher.clone();
        self.update(move |config| config.apply_update(update, &cipher))
    }

    /// Best-effort lease acquisition.
    ///
    /// Succeeds when the lease is free, expired, or already held by `holder`.
    pub fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = (now + ttl).timestamp_millis();
        let conn = db::lock(&self.conn)?;
        let rows = conn
            .execute(
                "INSERT INTO service_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                 WHERE service_leases.expires_at <= ?4
                    OR service_leases.holder = excluded.holder",
                params![name, holder, expires_at, now.timestamp_millis()],
            )
            .context("Failed to acquire lease")?;
        Ok(rows > 0)
    }

    /// Releases the lease if `holder` still owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "DELETE FROM service_leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )
        .context("Failed to release lease")?;
        Ok(())
    }

    /// True if any holder owns an unexpired lease under `name`.
    pub fn lease_active(&self, name: &str) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM service_leases WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read lease")?;
        Ok(expires_at.map_or(false, |at| at > Utc::now().timestamp_millis()))
    }

    /// Convenience for callers that need the video API section.
    pub fn video_api(&self) -> Result<super::VideoApiConfig> {
        self.load()?
            .video_api
            .ok_or_else(|| anyhow!("Video platform API is not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{VideoApiConfig, VideoApiUpdate};

    fn store() -> ServiceCredentialStore {
        let cipher = SecretCipher::from_site_secret("test-secret").unwrap();
        ServiceCredentialStore::new(":memory:", cipher).expect("Failed to create test store")
    }

    #[test]
    fn test_load_empty() {
        let config = store().load().unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert!(config.video_api.is_none());
    }

    #[test]
    fn test_update_bumps_version() {
        let store = store();
        let first = store
            .update(|c| {
                c.video_api = Some(VideoApiConfig::new("https://video.example.org"));
                Ok(())
            })
            .unwrap();
        assert_eq!(first.version, 1);

        let second = store.update(|_| Ok(())).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(store.load().unwrap().version, 2);
    }

    #[test]
    fn test_invalid_update_not_written() {
        let store = store();
        let result = store.update(|c| {
            c.video_api = Some(VideoApiConfig::new("not a url"));
            Ok(())
        });
        assert!(result.is_err());
        assert!(store.load().unwrap().video_api.is_none());
    }

    #[test]
    fn test_apply_update_encrypts_secret() {
        let store = store();
        store
            .apply_update(ServiceConfigUpdate {
                video_api: Some(VideoApiUpdate {
                    base_url: Some("https://video.example.org".to_string()),
                    client_id: Some("client".to_string()),
                    client_secret: Some("shh".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();

        let api = store.video_api().unwrap();
        assert_eq!(store.reveal(api.client_secret.as_ref().unwrap()).unwrap(), "shh");
    }

    #[test]
    fn test_file_backed_config_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let cipher = SecretCipher::from_site_secret("test-secret").unwrap();

        {
            let store = ServiceCredentialStore::new(&path, cipher.clone()).unwrap();
            store
                .update(|c| {
                    c.video_api = Some(VideoApiConfig::new("https://video.example.org"));
                    Ok(())
                })
                .unwrap();
        }

        let reopened = ServiceCredentialStore::new(&path, cipher).unwrap();
        assert_eq!(
            reopened.video_api().unwrap().base_url,
            "https://video.example.org"
        );
    }

    #[test]
    fn test_lease_excludes_other_holders() {
        let store = store();
        let ttl = Duration::seconds(30);

        assert!(store.try_acquire_lease("admin-token", "a", ttl).unwrap());
        assert!(!store.try_acquire_lease("admin-token", "b", ttl).unwrap());
        assert!(store.try_acquire_lease("admin-token", "a", ttl).unwrap());
        assert!(store.lease_active("admin-token").unwrap());

        store.release_lease("admin-token", "a").unwrap();
        assert!(!store.lease_active("admin-token").unwrap());
        assert!(store.try_acquire_lease("admin-token", "b", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let store = store();
        assert!(store
            .try_acquire_lease("admin-token", "a", Duration::milliseconds(-1))
            .unwrap());
        assert!(!store.lease_active("admin-token").unwrap());
        assert!(store
            .try_acquire_lease("admin-token", "b", Duration::seconds(30))
            .unwrap());
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let store = store();
        store
            .try_acquire_lease("admin-token", "a", Duration::seconds(30))
            .unwrap();
        store.release_lease("admin-token", "b").unwrap();
        assert!(store.lease_active("admin-token").unwrap());
    }
}
