//! Per-user video-platform token storage using SQLite.
//!
//! One row per forum account. Secret columns hold [`Ciphertext`] only.

use super::Ciphertext;
use crate::db::{self, parse_opt_ts, parse_ts};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Maximum stored length of `last_mint_error`.
const MAX_ERROR_LEN: usize = 500;

/// Stored token row for one forum account.
#[derive(Clone, Debug)]
pub struct TokenRecord {
    pub forum_account_id: i64,
    /// Filled in by the repair path
    pub video_account_id: Option<i64>,
    /// `None` when only a mint error has been recorded for this account
    pub access_token_enc: Option<Ciphertext>,
    pub refresh_token_enc: Option<Ciphertext>,
    /// `None` on legacy rows; consumers apply the default-TTL heuristic
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_mint_at: Option<DateTime<Utc>>,
    pub last_mint_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Most recent time this row is known to have held a fresh token.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_refresh_at
            .or(self.last_mint_at)
            .unwrap_or(self.updated_at)
    }
}

/// Storage contract for per-user tokens. All writes are upserts keyed by
/// forum account id.
pub trait TokenStore: Send + Sync {
    fn get(&self, forum_account_id: i64) -> Result<Option<TokenRecord>>;

    /// Full upsert after a mint. Replaces both tokens and the expiry, clears
    /// `last_mint_error`.
    fn save(
        &self,
        forum_account_id: i64,
        access_enc: &Ciphertext,
        refresh_enc: Option<&Ciphertext>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Refresh-only write. Never touches `refresh_token_enc` or mint metadata.
    ///
    /// Returns `false` when no row exists for the account.
    fn update_access(
        &self,
        forum_account_id: i64,
        access_enc: &Ciphertext,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Records a mint failure, creating a token-less row when needed.
    fn touch_mint_error(&self, forum_account_id: i64, message: &str) -> Result<()>;

    /// Sets or clears the video account the tokens belong to.
    fn set_video_account(&self, forum_account_id: i64, video_account_id: Option<i64>)
        -> Result<()>;

    /// Returns `true` if a row was deleted.
    fn delete(&self, forum_account_id: i64) -> Result<bool>;
}

/// SQLite-backed [`TokenStore`].
///
/// # Schema
/// ```sql
/// CREATE TABLE video_tokens (
///     forum_account_id  INTEGER PRIMARY KEY,
///     video_account_id  INTEGER,
///     access_token_enc  TEXT,     -- nonce-prefixed AES-256-GCM
///     refresh_token_enc TEXT,
///     expires_at        TEXT,     -- ISO 8601, NULL on legacy rows
///     last_refresh_at   TEXT,
///     last_mint_at      TEXT,
///     last_mint_error   TEXT,
///     created_at        TEXT NOT NULL,
///     updated_at        TEXT NOT NULL
/// );
/// ```
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Creates or opens the token table in the given database.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open token database")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS video_tokens (
                forum_account_id  INTEGER PRIMARY KEY,
                video_account_id  INTEGER,
                access_token_enc  TEXT,
                refresh_token_enc TEXT,
                expires_at        TEXT,
                last_refresh_at   TEXT,
                last_mint_at      TEXT,
                last_mint_error   TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );",
        )
        .context("Failed to create video_tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, forum_account_id: i64) -> Result<Option<TokenRecord>> {
        let conn = db::lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT video_account_id, access_token_enc, refresh_token_enc, expires_at,
                        last_refresh_at, last_mint_at, last_mint_error, created_at, updated_at
                 FROM video_tokens WHERE forum_account_id = ?1",
                params![forum_account_id],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query video_tokens")?;

        let Some((video, access, refresh, expires, refreshed, minted, error, created, updated)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(TokenRecord {
            forum_account_id,
            video_account_id: video,
            access_token_enc: access.map(Ciphertext::from_stored),
            refresh_token_enc: refresh.map(Ciphertext::from_stored),
            expires_at: parse_opt_ts(expires).context("Failed to parse expires_at")?,
            last_refresh_at: parse_opt_ts(refreshed)?,
            last_mint_at: parse_opt_ts(minted)?,
            last_mint_error: error,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        }))
    }

    fn save(
        &self,
        forum_account_id: i64,
        access_enc: &Ciphertext,
        refresh_enc: Option<&Ciphertext>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO video_tokens (
                forum_account_id, access_token_enc, refresh_token_enc, expires_at,
                last_mint_at, last_mint_error, created_at, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?5, ?5)
             ON CONFLICT(forum_account_id) DO UPDATE SET
                access_token_enc = excluded.access_token_enc,
                refresh_token_enc = excluded.refresh_token_enc,
                expires_at = excluded.expires_at,
                last_mint_at = excluded.last_mint_at,
                last_mint_error = NULL,
                updated_at = excluded.updated_at",
            params![
                forum_account_id,
                access_enc.as_str(),
                refresh_enc.map(Ciphertext::as_str),
                expires_at.map(|dt| dt.to_rfc3339()),
                now,
            ],
        )
        .context("Failed to save video tokens")?;
        Ok(())
    }

    fn update_access(
        &self,
        forum_account_id: i64,
        access_enc: &Ciphertext,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let conn = db::lock(&self.conn)?;
        let rows = conn
            .execute(
                "UPDATE video_tokens
                 SET access_token_enc = ?2, expires_at = ?3, last_refresh_at = ?4, updated_at = ?4
                 WHERE forum_account_id = ?1",
                params![
                    forum_account_id,
                    access_enc.as_str(),
                    expires_at.map(|dt| dt.to_rfc3339()),
                    now,
                ],
            )
            .context("Failed to update access token")?;
        Ok(rows > 0)
    }

    fn touch_mint_error(&self, forum_account_id: i64, message: &str) -> Result<()> {
        let message: String = message.chars().take(MAX_ERROR_LEN).collect();
        let now = Utc::now().to_rfc3339();
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO video_tokens (forum_account_id, last_mint_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(forum_account_id) DO UPDATE SET
                last_mint_error = excluded.last_mint_error,
                updated_at = excluded.updated_at",
            params![forum_account_id, message, now],
        )
        .context("Failed to record mint error")?;
        Ok(())
    }

    fn set_video_account(
        &self,
        forum_account_id: i64,
        video_account_id: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO video_tokens (forum_account_id, video_account_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(forum_account_id) DO UPDATE SET
                video_account_id = excluded.video_account_id,
                updated_at = excluded.updated_at",
            params![forum_account_id, video_account_id, now],
        )
        .context("Failed to set video account on token row")?;
        Ok(())
    }

    fn delete(&self, forum_account_id: i64) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let rows = conn
            .execute(
                "DELETE FROM video_tokens WHERE forum_account_id = ?1",
                params![forum_account_id],
            )
            .context("Failed to delete video tokens")?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SecretCipher;
    use chrono::Duration;

    fn setup() -> (SqliteTokenStore, SecretCipher) {
        let store = SqliteTokenStore::new(":memory:").expect("Failed to create test store");
        let cipher = SecretCipher::from_site_secret("test-secret").unwrap();
        (store, cipher)
    }

    #[test]
    fn test_save_and_get() {
        let (store, cipher) = setup();
        let access = cipher.encrypt("access-token-12345").unwrap();
        let refresh = cipher.encrypt("refresh-token-67890").unwrap();
        let expires = Utc::now() + Duration::hours(1);

        store.save(7, &access, Some(&refresh), Some(expires)).unwrap();

        let record = store.get(7).unwrap().expect("Record not found");
        assert_eq!(
            cipher.decrypt(record.access_token_enc.as_ref().unwrap()).unwrap(),
            "access-token-12345"
        );
        assert_eq!(
            cipher.decrypt(record.refresh_token_enc.as_ref().unwrap()).unwrap(),
            "refresh-token-67890"
        );
        assert_eq!(record.expires_at.unwrap().timestamp(), expires.timestamp());
        assert!(record.last_mint_at.is_some());
        assert!(record.last_mint_error.is_none());
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _) = setup();
        assert!(store.get(99).unwrap().is_none());
    }

    #[test]
    fn test_update_access_keeps_refresh_token() {
        let (store, cipher) = setup();
        let refresh = cipher.encrypt("refresh").unwrap();
        store
            .save(7, &cipher.encrypt("old").unwrap(), Some(&refresh), None)
            .unwrap();
        let before = store.get(7).unwrap().unwrap();

        let new_expiry = Utc::now() + Duration::hours(2);
        let updated = store
            .update_access(7, &cipher.encrypt("new").unwrap(), Some(new_expiry))
            .unwrap();
        assert!(updated);

        let after = store.get(7).unwrap().unwrap();
        assert_eq!(after.refresh_token_enc, before.refresh_token_enc);
        assert_eq!(after.last_mint_at, before.last_mint_at);
        assert!(after.last_refresh_at.is_some());
        assert_eq!(
            cipher.decrypt(after.access_token_enc.as_ref().unwrap()).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_update_access_without_row() {
        let (store, cipher) = setup();
        let updated = store
            .update_access(1, &cipher.encrypt("x").unwrap(), None)
            .unwrap();
        assert!(!updated);
        assert!(store.get(1).unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_refresh_token() {
        let (store, cipher) = setup();
        store
            .save(
                7,
                &cipher.encrypt("a").unwrap(),
                Some(&cipher.encrypt("r1").unwrap()),
                None,
            )
            .unwrap();
        store.save(7, &cipher.encrypt("b").unwrap(), None, None).unwrap();

        let record = store.get(7).unwrap().unwrap();
        assert!(record.refresh_token_enc.is_none());
    }

    #[test]
    fn test_touch_mint_error_without_row() {
        let (store, _) = setup();
        store.touch_mint_error(5, "video platform unreachable").unwrap();

        let record = store.get(5).unwrap().unwrap();
        assert!(record.access_token_enc.is_none());
        assert_eq!(
            record.last_mint_error.as_deref(),
            Some("video platform unreachable")
        );
    }

    #[test]
    fn test_touch_mint_error_keeps_tokens_and_truncates() {
        let (store, cipher) = setup();
        store.save(5, &cipher.encrypt("a").unwrap(), None, None).unwrap();
        store.touch_mint_error(5, &"x".repeat(2000)).unwrap();

        let record = store.get(5).unwrap().unwrap();
        assert!(record.access_token_enc.is_some());
        assert_eq!(record.last_mint_error.unwrap().len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_successful_save_clears_mint_error() {
        let (store, cipher) = setup();
        store.touch_mint_error(5, "boom").unwrap();
        store.save(5, &cipher.encrypt("a").unwrap(), None, None).unwrap();

        assert!(store.get(5).unwrap().unwrap().last_mint_error.is_none());
    }

    #[test]
    fn test_set_video_account_and_delete() {
        let (store, _) = setup();
        store.set_video_account(3, Some(42)).unwrap();
        assert_eq!(store.get(3).unwrap().unwrap().video_account_id, Some(42));

        store.set_video_account(3, None).unwrap();
        assert_eq!(store.get(3).unwrap().unwrap().video_account_id, None);

        assert!(store.delete(3).unwrap());
        assert!(!store.delete(3).unwrap());
    }

    #[test]
    fn test_last_activity_prefers_refresh_time() {
        let (store, cipher) = setup();
        store.save(1, &cipher.encrypt("a").unwrap(), None, None).unwrap();
        let minted = store.get(1).unwrap().unwrap();
        assert_eq!(minted.last_activity(), minted.last_mint_at.unwrap());

        store.update_access(1, &cipher.encrypt("b").unwrap(), None).unwrap();
        let refreshed = store.get(1).unwrap().unwrap();
        assert_eq!(refreshed.last_activity(), refreshed.last_refresh_at.unwrap());
    }
}
